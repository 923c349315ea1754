/// In-memory view of one graph snapshot for answering navigation queries.
use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::models::{Entity, Relation, RelationKind};

/// Direction of a lineage walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Callers and referrers, following incoming edges.
    Upstream,
    /// Callees and imports, following outgoing edges.
    Downstream,
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "upstream" | "up" => Ok(Direction::Upstream),
            "downstream" | "down" => Ok(Direction::Downstream),
            other => Err(format!("unknown direction: {other}")),
        }
    }
}

/// How a search hit matched, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Exact,
    Prefix,
    Substring,
    Annotation,
}

#[derive(Debug, Clone)]
pub struct SearchHit<'a> {
    pub entity: &'a Entity,
    pub matched: MatchKind,
}

#[derive(Debug, Clone)]
pub struct UsageHit<'a> {
    pub entity: &'a Entity,
    pub relation: RelationKind,
}

#[derive(Debug, Clone)]
pub struct LineageHit<'a> {
    pub entity: &'a Entity,
    pub relation: RelationKind,
    pub depth: usize,
}

type Adjacency = HashMap<String, Vec<(String, RelationKind)>>;

pub struct GraphIndex {
    entities: Vec<Entity>,
    by_id: HashMap<String, usize>,
    incoming: Adjacency,
    outgoing: Adjacency,
}

impl GraphIndex {
    /// Build from validated entities and relations. Edges are kept in
    /// snapshot order so walks are deterministic.
    pub fn new(entities: Vec<Entity>, relations: &[Relation]) -> Self {
        let by_id = entities
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id.clone(), i))
            .collect();

        let mut incoming: Adjacency = HashMap::new();
        let mut outgoing: Adjacency = HashMap::new();
        for rel in relations {
            incoming
                .entry(rel.dst.clone())
                .or_default()
                .push((rel.src.clone(), rel.kind));
            outgoing
                .entry(rel.src.clone())
                .or_default()
                .push((rel.dst.clone(), rel.kind));
        }

        Self {
            entities,
            by_id,
            incoming,
            outgoing,
        }
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Entity> {
        self.by_id.get(id).map(|&i| &self.entities[i])
    }

    /// Entities a symbol refers to: exact name matches, or an entity id.
    pub fn resolve(&self, symbol: &str) -> Vec<&Entity> {
        let named: Vec<&Entity> = self
            .entities
            .iter()
            .filter(|e| e.symbol_name == symbol)
            .collect();
        if !named.is_empty() {
            return named;
        }
        self.get(symbol).into_iter().collect()
    }

    /// Rank symbols against a case-insensitive query.
    pub fn search(&self, query: &str, limit: usize) -> Vec<SearchHit<'_>> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }

        let mut hits: Vec<SearchHit<'_>> = self
            .entities
            .iter()
            .filter_map(|entity| {
                match_kind(entity, &needle).map(|matched| SearchHit { entity, matched })
            })
            .collect();

        hits.sort_by(|a, b| {
            a.matched
                .cmp(&b.matched)
                .then_with(|| a.entity.symbol_name.len().cmp(&b.entity.symbol_name.len()))
                .then_with(|| a.entity.symbol_name.cmp(&b.entity.symbol_name))
                .then_with(|| location_cmp(a.entity, b.entity))
        });
        hits.truncate(limit);
        hits
    }

    /// Entities with a `calls` or `references` edge into `symbol`.
    pub fn where_used(&self, symbol: &str, limit: usize) -> Vec<UsageHit<'_>> {
        let mut seen = HashSet::new();
        let mut hits = Vec::new();

        for target in self.resolve(symbol) {
            let Some(edges) = self.incoming.get(&target.id) else {
                continue;
            };
            for (src, kind) in edges {
                if !matches!(kind, RelationKind::Calls | RelationKind::References) {
                    continue;
                }
                if !seen.insert(src.as_str()) {
                    continue;
                }
                if let Some(entity) = self.get(src) {
                    hits.push(UsageHit {
                        entity,
                        relation: *kind,
                    });
                }
            }
        }

        hits.sort_by(|a, b| location_cmp(a.entity, b.entity));
        hits.truncate(limit);
        hits
    }

    /// Breadth-first transitive walk from `symbol`. Every node is reported
    /// once, at the depth it was first reached; the start nodes are not
    /// reported.
    pub fn lineage(&self, symbol: &str, direction: Direction, max_results: usize) -> Vec<LineageHit<'_>> {
        let adjacency = match direction {
            Direction::Upstream => &self.incoming,
            Direction::Downstream => &self.outgoing,
        };

        let starts = self.resolve(symbol);
        let mut visited: HashSet<&str> = starts.iter().map(|e| e.id.as_str()).collect();
        let mut queue: VecDeque<(&str, usize)> = starts.iter().map(|e| (e.id.as_str(), 0)).collect();
        let mut hits = Vec::new();

        while let Some((id, depth)) = queue.pop_front() {
            let Some(edges) = adjacency.get(id) else {
                continue;
            };
            for (next, kind) in edges {
                if hits.len() >= max_results {
                    return hits;
                }
                if !visited.insert(next.as_str()) {
                    continue;
                }
                let Some(entity) = self.get(next) else {
                    continue;
                };
                hits.push(LineageHit {
                    entity,
                    relation: *kind,
                    depth: depth + 1,
                });
                queue.push_back((next.as_str(), depth + 1));
            }
        }
        hits
    }
}

fn match_kind(entity: &Entity, needle: &str) -> Option<MatchKind> {
    let name = entity.symbol_name.to_lowercase();
    if name == needle {
        return Some(MatchKind::Exact);
    }
    if name.starts_with(needle) {
        return Some(MatchKind::Prefix);
    }
    if name.contains(needle) {
        return Some(MatchKind::Substring);
    }

    let annotation = entity.metadata.get("enrichment")?;
    let summary_hit = annotation
        .get("summary")
        .and_then(|v| v.as_str())
        .is_some_and(|s| s.to_lowercase().contains(needle));
    let tag_hit = annotation
        .get("tags")
        .and_then(|v| v.as_array())
        .is_some_and(|tags| {
            tags.iter()
                .filter_map(|t| t.as_str())
                .any(|t| t.to_lowercase() == needle)
        });
    (summary_hit || tag_hit).then_some(MatchKind::Annotation)
}

fn location_cmp(a: &Entity, b: &Entity) -> std::cmp::Ordering {
    a.span
        .file_path
        .cmp(&b.span.file_path)
        .then(a.span.start_line.cmp(&b.span.start_line))
        .then_with(|| a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityKind, SpanIdentity};

    fn entity(id: &str, name: &str, file: &str, line: usize) -> Entity {
        Entity {
            id: id.to_string(),
            symbol_name: name.to_string(),
            kind: EntityKind::Function,
            span: SpanIdentity::compute(file, line, line, name),
            metadata: serde_json::Map::new(),
        }
    }

    fn sample() -> GraphIndex {
        let mut annotated = entity("parse", "parse_config", "src/config.rs", 10);
        annotated.metadata.insert(
            "enrichment".to_string(),
            serde_json::json!({"summary": "Reads the TOML settings file", "tags": ["io", "settings"]}),
        );
        let entities = vec![
            entity("main", "main", "src/main.rs", 1),
            entity("run", "run", "src/main.rs", 10),
            annotated,
            entity("load", "load", "src/config.rs", 30),
            entity("config", "config", "src/config.rs", 1),
            entity("helper", "config_helper", "src/util.rs", 5),
        ];
        let relations = vec![
            Relation::new("main", "run", RelationKind::Calls),
            Relation::new("run", "parse", RelationKind::Calls),
            Relation::new("run", "load", RelationKind::References),
            Relation::new("parse", "load", RelationKind::Calls),
            Relation::new("main", "config", RelationKind::Imports),
            Relation::new("load", "helper", RelationKind::Calls),
        ];
        GraphIndex::new(entities, &relations)
    }

    #[test]
    fn test_search_ranking() {
        let index = sample();
        let hits = index.search("CONFIG", 10);
        let names: Vec<&str> = hits.iter().map(|h| h.entity.symbol_name.as_str()).collect();
        assert_eq!(names, vec!["config", "config_helper", "parse_config"]);
        assert_eq!(hits[0].matched, MatchKind::Exact);
        assert_eq!(hits[1].matched, MatchKind::Prefix);
        assert_eq!(hits[2].matched, MatchKind::Substring);

        let hits = index.search("toml", 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].matched, MatchKind::Annotation);
        assert_eq!(index.search("settings", 10)[0].entity.id, "parse");

        assert_eq!(index.search("config", 1).len(), 1);
        assert!(index.search("   ", 10).is_empty());
        assert!(index.search("nothing_here", 10).is_empty());
    }

    #[test]
    fn test_where_used() {
        let index = sample();
        let hits = index.where_used("load", 10);
        let ids: Vec<&str> = hits.iter().map(|h| h.entity.id.as_str()).collect();
        assert_eq!(ids, vec!["parse", "run"]);
        assert_eq!(hits[1].relation, RelationKind::References);

        // imports are not usages
        assert!(index.where_used("config", 10).is_empty());
        assert!(index.where_used("unknown", 10).is_empty());
        assert_eq!(index.where_used("load", 1).len(), 1);
    }

    #[test]
    fn test_lineage_directions() {
        let index = sample();

        let down = index.lineage("run", Direction::Downstream, 10);
        let ids: Vec<(&str, usize)> = down.iter().map(|h| (h.entity.id.as_str(), h.depth)).collect();
        assert_eq!(ids, vec![("parse", 1), ("load", 1), ("helper", 2)]);

        let up = index.lineage("load", Direction::Upstream, 10);
        let ids: Vec<(&str, usize)> = up.iter().map(|h| (h.entity.id.as_str(), h.depth)).collect();
        assert_eq!(ids, vec![("run", 1), ("parse", 1), ("main", 2)]);

        assert_eq!(index.lineage("main", Direction::Downstream, 2).len(), 2);
        assert!(index.lineage("main", Direction::Upstream, 10).is_empty());
    }

    #[test]
    fn test_lineage_handles_cycles() {
        let entities = vec![
            entity("a", "a", "a.rs", 1),
            entity("b", "b", "b.rs", 1),
            entity("c", "c", "c.rs", 1),
        ];
        let relations = vec![
            Relation::new("a", "b", RelationKind::Calls),
            Relation::new("b", "c", RelationKind::Calls),
            Relation::new("c", "a", RelationKind::Calls),
        ];
        let index = GraphIndex::new(entities, &relations);
        let hits = index.lineage("a", Direction::Downstream, 100);
        let ids: Vec<&str> = hits.iter().map(|h| h.entity.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn test_resolve_by_id() {
        let index = sample();
        assert_eq!(index.resolve("parse")[0].symbol_name, "parse_config");
        assert_eq!(index.resolve("run").len(), 1);
        assert!(index.resolve("ghost").is_empty());
        assert_eq!(index.len(), 6);
        assert!(!index.is_empty());
    }

    #[test]
    fn test_direction_parse() {
        assert_eq!("Upstream".parse::<Direction>().unwrap(), Direction::Upstream);
        assert_eq!("down".parse::<Direction>().unwrap(), Direction::Downstream);
        assert!("sideways".parse::<Direction>().is_err());
    }
}
