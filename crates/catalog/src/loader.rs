use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Instant;

use fleet_core::CatalogKind;
use metrics::{counter, histogram};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::{Catalog, CatalogEntry, CatalogError, CatalogFile, CatalogMetadata, FormatError};

/// Result of a successful load. `deferred` holds the aggregated unrecognized-metadata
/// error, if any; `catalog` still contains every valid entry.
#[derive(Debug)]
pub struct LoadReport {
    pub catalog: Catalog,
    pub deferred: Option<CatalogError>,
}

impl LoadReport {
    /// Collapse into a strict result, failing on deferred errors.
    pub fn into_result(self) -> Result<Catalog, CatalogError> {
        match self.deferred {
            Some(e) => Err(e),
            None => Ok(self.catalog),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CatalogLoader {
    kind: CatalogKind,
    catalog_dirs: Vec<PathBuf>,
    metadata_dirs: Vec<PathBuf>,
}

#[derive(Clone, Copy)]
enum Format { Json, Yaml }

fn file_format(path: &Path) -> Option<Format> {
    match path.extension().and_then(|s| s.to_str()).map(|s| s.to_ascii_lowercase()).as_deref() {
        Some("json") => Some(Format::Json),
        Some("yaml") | Some("yml") => Some(Format::Yaml),
        _ => None,
    }
}

fn decode<T: serde::de::DeserializeOwned>(format: Format, bytes: &[u8]) -> Result<T, FormatError> {
    match format {
        Format::Json => Ok(serde_json::from_slice(bytes)?),
        Format::Yaml => Ok(serde_yaml::from_slice(bytes)?),
    }
}

fn absolute(dir: &Path) -> Result<PathBuf, CatalogError> {
    if dir.is_absolute() {
        return Ok(dir.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(|e| CatalogError::Io { path: dir.to_path_buf(), source: e })?;
    Ok(cwd.join(dir.strip_prefix(".").unwrap_or(dir)))
}

/// Regular files under `dir` with a recognized extension, in file-name order.
/// Symlinks (including the root) are followed.
fn walk_files(dir: &Path) -> Result<Vec<(PathBuf, Format)>, CatalogError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).follow_links(true).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.into_path();
        if let Some(fmt) = file_format(&path) {
            files.push((path, fmt));
        }
    }
    Ok(files)
}

fn read(path: &Path) -> Result<Vec<u8>, CatalogError> {
    std::fs::read(path).map_err(|e| CatalogError::Io { path: path.to_path_buf(), source: e })
}

/// Lowercase hex sha256 over the canonical JSON of the entry.
fn checksum(file: &CatalogFile, meta: &CatalogMetadata) -> String {
    let canonical = serde_json::json!({
        "type": file.resource_type,
        "channels": file.channels,
        "metadata": meta,
    });
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

impl CatalogLoader {
    pub fn new(kind: CatalogKind, catalog_dirs: Vec<PathBuf>, metadata_dirs: Vec<PathBuf>) -> Self {
        Self { kind, catalog_dirs, metadata_dirs }
    }

    pub fn kind(&self) -> CatalogKind { self.kind }

    /// Load the catalog. Directory, parse and missing-metadata failures abort the load;
    /// metadata ids without a catalog file are reported through `LoadReport::deferred`.
    pub fn load(&self) -> Result<LoadReport, CatalogError> {
        let started = Instant::now();
        let kind = self.kind;
        let metadata = self.read_metadata()?;
        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut catalog = Catalog::new(kind);

        for dir in &self.catalog_dirs {
            let dir = absolute(dir)?;
            let wrap = |e: CatalogError| CatalogError::ListCatalogs { kind, dir: dir.clone(), source: Box::new(e) };
            let files = walk_files(&dir).map_err(wrap)?;
            for (path, fmt) in files {
                let bytes = read(&path).map_err(wrap)?;
                let mut file: CatalogFile = decode(fmt, &bytes)
                    .map_err(|e| wrap(CatalogError::ParseCatalog { path: path.clone(), source: e }))?;
                let id = file.resource_type.id.clone();
                let meta = metadata
                    .get(&id)
                    .cloned()
                    .ok_or_else(|| wrap(CatalogError::MissingMetadata { kind, id: id.clone() }))?;
                merge_metadata(&mut file, &meta);
                let sum = checksum(&file, &meta);
                file.resource_type.checksum = Some(sum.clone());
                let entry = CatalogEntry {
                    kind,
                    resource_type: file.resource_type,
                    channels: file.channels,
                    metadata: meta,
                    checksum: sum,
                    source: path.clone(),
                };
                if catalog.insert(entry).is_some() {
                    warn!(kind = %kind, id = %id, path = %path.display(), "catalog: duplicate type id; later file wins");
                }
                seen.insert(id);
            }
        }

        let mut unknown: Vec<String> = metadata.keys().filter(|id| !seen.contains(*id)).cloned().collect();
        unknown.sort();
        let deferred = if unknown.is_empty() { None } else { Some(CatalogError::Unrecognized { kind, ids: unknown }) };

        histogram!("catalog_load_ms", started.elapsed().as_secs_f64() * 1000.0, "kind" => kind.name());
        counter!("catalog_entries_loaded_total", catalog.len() as u64, "kind" => kind.name());
        info!(kind = %kind, entries = catalog.len(), deferred = deferred.is_some(), took_ms = %started.elapsed().as_millis(), "catalog: loaded");
        Ok(LoadReport { catalog, deferred })
    }

    fn read_metadata(&self) -> Result<HashMap<String, CatalogMetadata>, CatalogError> {
        let kind = self.kind;
        let mut out: HashMap<String, CatalogMetadata> = HashMap::new();
        for dir in &self.metadata_dirs {
            let dir = absolute(dir)?;
            let wrap = |e: CatalogError| CatalogError::ListMetadata { kind, dir: dir.clone(), source: Box::new(e) };
            let files = walk_files(&dir).map_err(wrap)?;
            for (path, fmt) in files {
                let bytes = read(&path).map_err(wrap)?;
                let list: Vec<CatalogMetadata> = decode(fmt, &bytes)
                    .map_err(|e| wrap(CatalogError::ReadMetadata { kind, path: path.clone(), source: e }))?;
                debug!(kind = %kind, path = %path.display(), count = list.len(), "catalog: metadata file read");
                for m in list {
                    out.insert(m.id.clone(), m);
                }
            }
        }
        Ok(out)
    }
}

/// Fold metadata labels, annotations, rank and channels into the type definition.
fn merge_metadata(file: &mut CatalogFile, meta: &CatalogMetadata) {
    let t = &mut file.resource_type;
    for l in &meta.labels {
        if !t.labels.contains(l) {
            t.labels.push(l.clone());
        }
    }
    for (k, v) in &meta.annotations {
        t.annotations.insert(k.clone(), v.clone());
    }
    if meta.featured_rank != 0 {
        t.featured_rank = meta.featured_rank;
    }
    let mut channels: BTreeSet<String> = t.channels.iter().cloned().collect();
    channels.extend(file.channels.keys().cloned());
    channels.extend(meta.channels.iter().cloned());
    t.channels = channels.into_iter().collect();
    t.deprecated = false;
    t.checksum = None;
}
