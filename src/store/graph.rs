/// JSON graph snapshots, one file per repository.
///
/// Writes go through a temp file and a rename so a reader never sees a
/// half-written snapshot.
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::models::{Entity, Graph, LoadReport, Relation, normalize_path};

const GRAPH_FILE: &str = "graph.json";

pub struct GraphStore {
    root: PathBuf,
    /// Serializes read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

impl GraphStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Snapshot location for a repository id. Always a direct child of the
    /// root: a leading `.` (so `.` and `..`) and an empty id map to `_`.
    pub fn graph_path(&self, repo_id: &str) -> PathBuf {
        let mut dir: String = repo_id
            .chars()
            .enumerate()
            .map(|(i, c)| {
                let keep = c.is_ascii_alphanumeric() || c == '-' || c == '_' || (c == '.' && i > 0);
                if keep { c } else { '_' }
            })
            .collect();
        if dir.is_empty() {
            dir.push('_');
        }
        self.root.join(dir).join(GRAPH_FILE)
    }

    pub fn exists(&self, repo_id: &str) -> bool {
        self.graph_path(repo_id).is_file()
    }

    /// Load and validate a snapshot.
    ///
    /// `NotFound` when no snapshot exists, `Corrupt` when it cannot be read
    /// as a graph. Dangling and duplicate edges are dropped, not rejected.
    pub fn load_graph(&self, repo_id: &str) -> Result<(Graph, LoadReport), StoreError> {
        let path = self.graph_path(repo_id);
        let data = match std::fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(repo_id.to_string()));
            }
            Err(e) => {
                return Err(StoreError::Corrupt {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                });
            }
        };

        let graph: Graph = serde_json::from_str(&data).map_err(|e| StoreError::Corrupt {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        debug!(
            repo = %repo_id,
            entities = graph.entities.len(),
            relations = graph.relations.len(),
            "Loaded graph snapshot"
        );
        Ok(graph.validate())
    }

    /// Persist a snapshot atomically.
    pub fn save_graph(&self, repo_id: &str, graph: &Graph) -> Result<(), StoreError> {
        let path = self.graph_path(repo_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let data = serde_json::to_vec_pretty(graph)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Replace a file's contribution to the graph.
    ///
    /// A missing snapshot starts empty. A corrupt one is discarded, since the
    /// indexer is about to rebuild it file by file anyway.
    pub fn upsert_entities(
        &self,
        repo_id: &str,
        file_path: &str,
        entities: Vec<Entity>,
        relations: Vec<Relation>,
    ) -> Result<LoadReport, StoreError> {
        let _guard = self.lock();
        let mut graph = self.load_or_empty(repo_id)?;

        let file_path = normalize_path(file_path);
        let count = entities.len();
        graph.replace_file(&file_path, entities, relations);

        let (graph, report) = graph.validate();
        self.save_graph(repo_id, &graph)?;

        debug!(repo = %repo_id, file = %file_path, entities = count, "Replaced file contribution");
        Ok(report)
    }

    /// Drop every entity and owned relation of a deleted file.
    pub fn remove_file(&self, repo_id: &str, file_path: &str) -> Result<(), StoreError> {
        self.upsert_entities(repo_id, file_path, Vec::new(), Vec::new())
            .map(|_| ())
    }

    /// Stamp the snapshot with the revision an index pass just completed at.
    pub fn record_index(&self, repo_id: &str, revision: &str) -> Result<(), StoreError> {
        let _guard = self.lock();
        let mut graph = self.load_or_empty(repo_id)?;
        graph.source_revision = Some(revision.trim().to_string());
        graph.indexed_at = Utc::now();
        self.save_graph(repo_id, &graph)?;

        info!(repo = %repo_id, revision = %revision.trim(), "Recorded index revision");
        Ok(())
    }

    fn load_or_empty(&self, repo_id: &str) -> Result<Graph, StoreError> {
        match self.load_graph(repo_id) {
            Ok((graph, _)) => Ok(graph),
            Err(StoreError::NotFound(_)) => Ok(Graph::empty(repo_id)),
            Err(StoreError::Corrupt { path, reason }) => {
                warn!(repo = %repo_id, path = %path, reason = %reason, "Discarding corrupt graph snapshot");
                Ok(Graph::empty(repo_id))
            }
            Err(e) => Err(e),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        // A panic while holding the lock leaves nothing half-written on disk.
        self.write_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityKind, RelationKind, SpanIdentity};

    fn entity(id: &str, file: &str) -> Entity {
        Entity {
            id: id.to_string(),
            symbol_name: id.to_string(),
            kind: EntityKind::Function,
            span: SpanIdentity::compute(file, 1, 1, id),
            metadata: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_missing_graph_is_not_found() {
        let temp = tempfile::tempdir().unwrap();
        let store = GraphStore::new(temp.path());
        assert!(matches!(
            store.load_graph("repo"),
            Err(StoreError::NotFound(_))
        ));
        assert!(!store.exists("repo"));
    }

    #[test]
    fn test_corrupt_graph() {
        let temp = tempfile::tempdir().unwrap();
        let store = GraphStore::new(temp.path());
        let path = store.graph_path("repo");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{\"version\": 1, \"entities\": [").unwrap();

        let err = store.load_graph("repo").unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
        assert!(err.is_missing_graph());
    }

    #[test]
    fn test_upsert_and_reload() {
        let temp = tempfile::tempdir().unwrap();
        let store = GraphStore::new(temp.path());

        store
            .upsert_entities("repo", "./b.rs", vec![entity("b", "b.rs")], vec![])
            .unwrap();
        let report = store
            .upsert_entities(
                "repo",
                "a.rs",
                vec![entity("a", "a.rs")],
                vec![Relation::new("a", "b", RelationKind::Calls)],
            )
            .unwrap();
        assert!(report.is_clean());

        let (graph, report) = store.load_graph("repo").unwrap();
        assert!(report.is_clean());
        assert_eq!(graph.entities.len(), 2);
        assert_eq!(graph.relations.len(), 1);
        assert_eq!(graph.files(), vec!["a.rs", "b.rs"]);
    }

    #[test]
    fn test_dangling_edge_dropped_on_upsert() {
        let temp = tempfile::tempdir().unwrap();
        let store = GraphStore::new(temp.path());

        let report = store
            .upsert_entities(
                "repo",
                "a.rs",
                vec![entity("a", "a.rs")],
                vec![Relation::new("a", "nowhere", RelationKind::Calls)],
            )
            .unwrap();
        assert_eq!(report.dangling_dropped, 1);
        let (graph, _) = store.load_graph("repo").unwrap();
        assert!(graph.relations.is_empty());
    }

    #[test]
    fn test_remove_file_and_record_index() {
        let temp = tempfile::tempdir().unwrap();
        let store = GraphStore::new(temp.path());
        store
            .upsert_entities("repo", "a.rs", vec![entity("a", "a.rs")], vec![])
            .unwrap();
        store
            .upsert_entities("repo", "b.rs", vec![entity("b", "b.rs")], vec![])
            .unwrap();

        store.remove_file("repo", "a.rs").unwrap();
        store.record_index("repo", " ABC123\n").unwrap();

        let (graph, _) = store.load_graph("repo").unwrap();
        assert_eq!(graph.entities.len(), 1);
        assert_eq!(graph.source_revision.as_deref(), Some("ABC123"));
    }

    #[test]
    fn test_repo_id_is_sanitized() {
        let store = GraphStore::new("/data");
        let path = store.graph_path("org/repo name");
        assert_eq!(path, PathBuf::from("/data/org_repo_name/graph.json"));
        assert_eq!(
            store.graph_path("my.repo"),
            PathBuf::from("/data/my.repo/graph.json")
        );
    }

    #[test]
    fn test_dot_ids_stay_under_root() {
        let store = GraphStore::new("/data");
        for id in ["..", ".", "", "../etc", ".hidden"] {
            let path = store.graph_path(id);
            let dir = path.parent().unwrap();
            assert_eq!(dir.parent().unwrap(), Path::new("/data"), "id {id:?}");
            let name = dir.file_name().unwrap().to_str().unwrap();
            assert!(!name.starts_with('.'), "id {id:?} gave {name:?}");
        }
        assert_eq!(store.graph_path(".."), PathBuf::from("/data/_./graph.json"));
    }
}
