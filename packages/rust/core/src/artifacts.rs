//! Output artifacts: one `<output_dir>/pages/<entity_id>.json` per entity.

use std::path::{Path, PathBuf};

use tracing::debug;

use councilgen_shared::{CouncilgenError, GeneratedPage, Result};

use crate::checkpoint::write_atomic;

pub const PAGES_DIR: &str = "pages";

/// Reads and writes generated pages.
pub struct ArtifactStore {
    pages_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(output_dir: &Path) -> Self {
        Self {
            pages_dir: output_dir.join(PAGES_DIR),
        }
    }

    pub fn pages_dir(&self) -> &Path {
        &self.pages_dir
    }

    /// File for `entity_id`. The id is percent-encoded, so distinct ids
    /// get distinct files and none can leave the pages directory.
    pub fn path_for(&self, entity_id: &str) -> PathBuf {
        self.pages_dir.join(format!("{}.json", urlencoding::encode(entity_id)))
    }

    /// Persist a page. Failures are fatal to the run.
    pub async fn write(&self, page: &GeneratedPage) -> Result<PathBuf> {
        let path = self.path_for(&page.entity_id);
        let bytes = serde_json::to_vec_pretty(page)
            .map_err(|e| CouncilgenError::persistence(&path, e.to_string()))?;
        write_atomic(&path, &bytes).await?;
        debug!(path = %path.display(), "artifact written");
        Ok(path)
    }

    pub async fn read(&self, entity_id: &str) -> Result<Option<GeneratedPage>> {
        let path = self.path_for(entity_id);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CouncilgenError::io(&path, e)),
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| CouncilgenError::parse(format!("{}: {e}", path.display())))
    }

    /// Number of artifacts on disk.
    pub fn count(&self) -> usize {
        std::fs::read_dir(&self.pages_dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
                    .count()
            })
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use councilgen_shared::{CURRENT_SCHEMA_VERSION, EnrichmentSource, FieldMap};
    use uuid::Uuid;

    fn page(id: &str) -> GeneratedPage {
        GeneratedPage {
            schema_version: CURRENT_SCHEMA_VERSION,
            entity_id: id.into(),
            entity_name: "Adur".into(),
            title: "Adur planning services".into(),
            body: "# Adur planning services\n".into(),
            fields: FieldMap::new(),
            enrichment_source: EnrichmentSource::None,
            word_count: 4,
            cost: 0.0,
            content_hash: "h".into(),
            generated_at: Utc::now(),
        }
    }

    #[test]
    fn ids_cannot_escape_pages_dir() {
        let store = ArtifactStore::new(Path::new("/out"));
        assert_eq!(store.path_for("E07000223"), Path::new("/out/pages/E07000223.json"));
        assert_eq!(
            store.path_for("../../etc/passwd"),
            Path::new("/out/pages/..%2F..%2Fetc%2Fpasswd.json")
        );
    }

    #[test]
    fn distinct_ids_never_share_a_file() {
        let store = ArtifactStore::new(Path::new("/out"));
        let ids = ["a b", "a_b", "a/b", "a%20b", ".a", "a", "A"];
        let paths: std::collections::HashSet<_> = ids.iter().map(|id| store.path_for(id)).collect();
        assert_eq!(paths.len(), ids.len());
    }

    #[tokio::test]
    async fn write_read_and_count() {
        let dir = std::env::temp_dir().join(format!("cg_art_{}", Uuid::now_v7()));
        let store = ArtifactStore::new(&dir);
        assert_eq!(store.count(), 0);
        assert!(store.read("adur").await.unwrap().is_none());

        store.write(&page("adur")).await.unwrap();
        assert_eq!(store.count(), 1);
        assert_eq!(store.read("adur").await.unwrap().unwrap().entity_id, "adur");
    }
}
