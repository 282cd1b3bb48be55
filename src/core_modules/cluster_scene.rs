// THEORY:
// The `ClusterScene` is the live, scrolling picture of detected particles. Every
// cluster that comes out of a frame-buffer fill becomes a node placed at the right-hand
// edge of a moving field; each render tick the field scrolls by `speed · dt`, carrying
// older clusters toward and past the left edge, where they are culled.
//
// Key architectural principles:
// 1.  **Capabilities, not inheritance**: nodes expose a small `SceneNode` interface
//     (identity, position, parent). The scene owns them in plain maps.
// 2.  **Stable identity**: node ids come from a monotonically increasing counter and are
//     never reused, so a stale id can only ever miss, never alias a newer node.
// 3.  **One label per node**: labels live under a single label container and are keyed
//     by an opaque caller key. A node owns at most one label, so the label count can
//     never exceed the number of displayed nodes.
// 4.  **Labels follow**: `scroll` repositions every label at its node plus a fixed
//     offset, so callers never have to re-issue labels as the field moves.
// 5.  **Idempotent removal**: cleaning up an id that is already gone is a no-op.

use crate::core_modules::classifier::ParticleKind;
use crate::core_modules::frame_buffer::FrameStats;
use crate::error::SceneError;
use std::collections::BTreeMap;
use tracing::debug;

/// Opaque, never-reused node identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeId(pub u64);

/// A position in viewport coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// The capability every node in the scene offers.
pub trait SceneNode {
    fn id(&self) -> NodeId;
    fn position(&self) -> Point;
    fn set_position(&mut self, position: Point);
    /// The node this one is attached to; `None` for top-level nodes.
    fn parent(&self) -> Option<NodeId>;
}

/// The moving field of cluster hits.
#[derive(Debug, Clone)]
pub struct ClusterFieldNode {
    id: NodeId,
    pub width: f64,
    pub height: f64,
    /// Total distance scrolled so far.
    offset: f64,
}

impl ClusterFieldNode {
    pub fn offset(&self) -> f64 {
        self.offset
    }
}

impl SceneNode for ClusterFieldNode {
    fn id(&self) -> NodeId {
        self.id
    }
    fn position(&self) -> Point {
        Point::new(-self.offset, 0.0)
    }
    fn set_position(&mut self, position: Point) {
        self.offset = -position.x;
    }
    fn parent(&self) -> Option<NodeId> {
        None
    }
}

/// One displayed cluster.
#[derive(Debug, Clone)]
pub struct ClusterNode {
    id: NodeId,
    field: NodeId,
    position: Point,
    pub radius: f64,
    pub kind: ParticleKind,
    pub energy: f64,
    /// Key of the label attached to this node, if any.
    label: Option<String>,
}

impl ClusterNode {
    pub fn label_key(&self) -> Option<&str> {
        self.label.as_deref()
    }
}

impl SceneNode for ClusterNode {
    fn id(&self) -> NodeId {
        self.id
    }
    fn position(&self) -> Point {
        self.position
    }
    fn set_position(&mut self, position: Point) {
        self.position = position;
    }
    fn parent(&self) -> Option<NodeId> {
        Some(self.field)
    }
}

#[derive(Debug, Clone)]
pub struct LabelContainer {
    id: NodeId,
}

impl SceneNode for LabelContainer {
    fn id(&self) -> NodeId {
        self.id
    }
    fn position(&self) -> Point {
        Point::default()
    }
    fn set_position(&mut self, _position: Point) {}
    fn parent(&self) -> Option<NodeId> {
        None
    }
}

/// Text attached to a cluster node.
#[derive(Debug, Clone)]
pub struct LabelNode {
    id: NodeId,
    container: NodeId,
    pub key: String,
    pub owner: NodeId,
    pub text: String,
    position: Point,
}

impl LabelNode {
    /// Number of characters (not bytes) in the label text.
    pub fn char_count(&self) -> usize {
        self.text.chars().count()
    }

    /// Rendered width for a fixed-advance font.
    pub fn width(&self, glyph_advance: f64) -> f64 {
        self.char_count() as f64 * glyph_advance
    }
}

impl SceneNode for LabelNode {
    fn id(&self) -> NodeId {
        self.id
    }
    fn position(&self) -> Point {
        self.position
    }
    fn set_position(&mut self, position: Point) {
        self.position = position;
    }
    fn parent(&self) -> Option<NodeId> {
        Some(self.container)
    }
}

/// Geometry of the scene viewport and cluster visuals.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SceneConfig {
    pub width: f64,
    pub height: f64,
    /// Detector rows, used to map a cluster's centroid row into the viewport.
    pub detector_height: f64,
    pub min_radius: f64,
    pub max_radius: f64,
    /// Radius added per square root of cluster energy.
    pub radius_per_sqrt_energy: f64,
    /// Label placement relative to its node.
    pub label_offset: Point,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            width: 1024.0,
            height: 768.0,
            detector_height: 256.0,
            min_radius: 3.0,
            max_radius: 40.0,
            radius_per_sqrt_energy: 0.8,
            label_offset: Point::new(0.0, -14.0),
        }
    }
}

/// Scrolling scene graph of cluster nodes with a label overlay.
#[derive(Debug)]
pub struct ClusterScene {
    config: SceneConfig,
    field: ClusterFieldNode,
    container: Option<LabelContainer>,
    nodes: BTreeMap<NodeId, ClusterNode>,
    labels: BTreeMap<String, LabelNode>,
    next_id: u64,
}

impl ClusterScene {
    pub fn new(config: SceneConfig) -> Self {
        let field = ClusterFieldNode {
            id: NodeId(0),
            width: config.width,
            height: config.height,
            offset: 0.0,
        };
        Self {
            config,
            field,
            container: None,
            nodes: BTreeMap::new(),
            labels: BTreeMap::new(),
            next_id: 1,
        }
    }

    fn allocate_id(&mut self) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn config(&self) -> &SceneConfig {
        &self.config
    }

    pub fn field(&self) -> &ClusterFieldNode {
        &self.field
    }

    /// Advances the field by `speed · dt` and moves every node and label with it.
    /// Returns the ids of nodes that are now entirely outside the viewport.
    pub fn scroll(&mut self, dt: f64, speed: f64) -> Vec<NodeId> {
        let distance = speed * dt;
        let distance = if distance.is_finite() { distance } else { 0.0 };
        self.field.offset += distance;

        let width = self.config.width;
        let mut offscreen = Vec::new();
        for node in self.nodes.values_mut() {
            let mut position = node.position();
            position.x -= distance;
            node.set_position(position);
            if position.x + node.radius < 0.0 || position.x - node.radius > width {
                offscreen.push(node.id);
            }
        }
        self.reposition_labels();
        offscreen
    }

    fn reposition_labels(&mut self) {
        let offset = self.config.label_offset;
        for label in self.labels.values_mut() {
            if let Some(owner) = self.nodes.get(&label.owner) {
                let anchor = owner.position();
                label.set_position(Point::new(anchor.x + offset.x, anchor.y + offset.y));
            }
        }
    }

    /// Places a node for a freshly filled cluster at the right edge of the viewport,
    /// at the cluster's detector row. Larger energies draw larger nodes.
    pub fn add_cluster_node(&mut self, stats: &FrameStats, kind: ParticleKind) -> NodeId {
        let radius = (self.config.min_radius + self.config.radius_per_sqrt_energy * stats.energy.max(0.0).sqrt())
            .min(self.config.max_radius);
        let row_scale = if self.config.detector_height > 0.0 {
            self.config.height / self.config.detector_height
        } else {
            1.0
        };
        let y = (stats.center_y * row_scale).clamp(0.0, self.config.height);
        let position = Point::new(self.config.width - radius, y);
        self.add_node_at(position, radius, kind, stats.energy)
    }

    /// Places a cluster node at an explicit viewport position.
    pub fn add_node_at(&mut self, position: Point, radius: f64, kind: ParticleKind, energy: f64) -> NodeId {
        let id = self.allocate_id();
        self.nodes.insert(
            id,
            ClusterNode {
                id,
                field: self.field.id,
                position,
                radius,
                kind,
                energy,
                label: None,
            },
        );
        id
    }

    /// Creates the label container if it does not exist yet and returns its id.
    pub fn add_label_container(&mut self) -> NodeId {
        if let Some(container) = &self.container {
            return container.id;
        }
        let id = self.allocate_id();
        self.container = Some(LabelContainer { id });
        id
    }

    pub fn has_label_container(&self) -> bool {
        self.container.is_some()
    }

    /// Attaches a label keyed by `key` to `node`, anchored at the node's current
    /// position. A node keeps at most one label: labelling it again replaces the old one.
    pub fn add_label_for_node(&mut self, node: NodeId, key: &str) -> Result<NodeId, SceneError> {
        let container = self.container.as_ref().ok_or(SceneError::NoLabelContainer)?.id;
        let (anchor, text, previous) = {
            let cluster = self.nodes.get(&node).ok_or(SceneError::NodeNotFound(node))?;
            if let Some(existing) = self.labels.get(key) {
                if existing.owner != node {
                    return Err(SceneError::DuplicateLabel {
                        key: key.to_string(),
                        owner: existing.owner,
                    });
                }
            }
            (
                cluster.position(),
                format!("{} {:.0}", cluster.kind.symbol(), cluster.energy),
                cluster.label.clone(),
            )
        };
        if let Some(previous) = previous {
            self.labels.remove(&previous);
        }

        let id = self.allocate_id();
        let offset = self.config.label_offset;
        self.labels.insert(
            key.to_string(),
            LabelNode {
                id,
                container,
                key: key.to_string(),
                owner: node,
                text,
                position: Point::new(anchor.x + offset.x, anchor.y + offset.y),
            },
        );
        if let Some(cluster) = self.nodes.get_mut(&node) {
            cluster.label = Some(key.to_string());
        }
        Ok(id)
    }

    pub fn label_count(&self) -> usize {
        self.labels.len()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, id: NodeId) -> Option<&ClusterNode> {
        self.nodes.get(&id)
    }

    pub fn label(&self, key: &str) -> Option<&LabelNode> {
        self.labels.get(key)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ClusterNode> {
        self.nodes.values()
    }

    pub fn labels(&self) -> impl Iterator<Item = &LabelNode> {
        self.labels.values()
    }

    /// Removes `id` together with the labels that hang off it. Removing the label
    /// container removes every label. Unknown or already removed ids are ignored.
    /// Returns whether anything was removed.
    pub fn clean_up_children_and_remove(&mut self, id: NodeId) -> bool {
        if let Some(node) = self.nodes.remove(&id) {
            if let Some(key) = node.label {
                self.labels.remove(&key);
            }
            return true;
        }
        if self.container.as_ref().is_some_and(|c| c.id == id) {
            self.container = None;
            for node in self.nodes.values_mut() {
                node.label = None;
            }
            self.labels.clear();
            return true;
        }
        let key = self.labels.values().find(|l| l.id == id).map(|l| l.key.clone());
        if let Some(key) = key {
            if let Some(label) = self.labels.remove(&key) {
                if let Some(owner) = self.nodes.get_mut(&label.owner) {
                    owner.label = None;
                }
            }
            return true;
        }
        false
    }

    /// Removes every id in `ids`; returns how many were actually present.
    pub fn cull(&mut self, ids: &[NodeId]) -> usize {
        let removed = ids.iter().filter(|id| self.clean_up_children_and_remove(**id)).count();
        if removed > 0 {
            debug!(removed, remaining = self.nodes.len(), "culled off-screen clusters");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::classifier::ClusterShape;

    fn scene() -> ClusterScene {
        ClusterScene::new(SceneConfig {
            width: 100.0,
            height: 50.0,
            detector_height: 256.0,
            min_radius: 2.0,
            max_radius: 10.0,
            radius_per_sqrt_energy: 0.5,
            label_offset: Point::new(0.0, -5.0),
        })
    }

    fn stats(center_y: f64, energy: f64) -> FrameStats {
        FrameStats {
            index: 0,
            center_x: 10.0,
            center_y,
            energy,
            hits: 3,
            max_count: 10,
            shape: ClusterShape::default(),
        }
    }

    #[test]
    fn scroll_advances_offset_and_nodes() {
        let mut scene = scene();
        let id = scene.add_node_at(Point::new(50.0, 10.0), 2.0, ParticleKind::Beta, 20.0);
        assert!(scene.scroll(0.5, 20.0).is_empty());
        assert_eq!(scene.field().offset(), 10.0);
        assert_eq!(scene.node(id).map(|n| n.position().x), Some(40.0));
    }

    #[test]
    fn nodes_past_the_left_edge_are_reported_and_culled() {
        let mut scene = scene();
        let near = scene.add_node_at(Point::new(5.0, 10.0), 2.0, ParticleKind::Gamma, 5.0);
        let far = scene.add_node_at(Point::new(90.0, 10.0), 2.0, ParticleKind::Gamma, 5.0);
        let gone = scene.scroll(1.0, 10.0);
        assert_eq!(gone, vec![near]);
        assert_eq!(scene.cull(&gone), 1);
        assert!(scene.node(near).is_none());
        assert!(scene.node(far).is_some());
    }

    #[test]
    fn cluster_nodes_enter_at_right_edge_scaled_by_row() {
        let mut scene = scene();
        let id = scene.add_cluster_node(&stats(128.0, 16.0), ParticleKind::Beta);
        let node = scene.node(id).unwrap();
        // radius = 2 + 0.5 * sqrt(16) = 4
        assert_eq!(node.radius, 4.0);
        assert_eq!(node.position(), Point::new(96.0, 25.0));
        assert_eq!(node.parent(), Some(scene.field().id()));

        let huge = scene.add_cluster_node(&stats(0.0, 1.0e6), ParticleKind::Alpha);
        assert_eq!(scene.node(huge).map(|n| n.radius), Some(10.0));
    }

    #[test]
    fn label_container_is_idempotent() {
        let mut scene = scene();
        let first = scene.add_label_container();
        assert_eq!(scene.add_label_container(), first);
    }

    #[test]
    fn labels_require_container_and_live_node() {
        let mut scene = scene();
        let node = scene.add_node_at(Point::new(50.0, 10.0), 2.0, ParticleKind::Muon, 80.0);
        assert_eq!(scene.add_label_for_node(node, "a"), Err(SceneError::NoLabelContainer));
        scene.add_label_container();
        assert_eq!(
            scene.add_label_for_node(NodeId(999), "a"),
            Err(SceneError::NodeNotFound(NodeId(999)))
        );
        scene.add_label_for_node(node, "a").unwrap();
        assert_eq!(scene.label_count(), 1);
        assert_eq!(scene.label("a").map(|l| l.text.as_str()), Some("μ 80"));
        assert_eq!(scene.label("a").map(|l| l.char_count()), Some(4));
    }

    #[test]
    fn label_width_counts_characters_not_bytes() {
        let mut scene = scene();
        scene.add_label_container();
        let node = scene.add_node_at(Point::new(50.0, 10.0), 2.0, ParticleKind::Gamma, 1234.0);
        scene.add_label_for_node(node, "g").unwrap();
        let label = scene.label("g").unwrap();
        assert_eq!(label.text, "γ 1234");
        assert_eq!(label.text.len(), 7);
        assert_eq!(label.width(8.0), 48.0);
    }

    #[test]
    fn one_label_per_node_and_unique_keys() {
        let mut scene = scene();
        scene.add_label_container();
        let a = scene.add_node_at(Point::new(50.0, 10.0), 2.0, ParticleKind::Beta, 1.0);
        let b = scene.add_node_at(Point::new(60.0, 10.0), 2.0, ParticleKind::Beta, 1.0);
        scene.add_label_for_node(a, "first").unwrap();
        scene.add_label_for_node(a, "second").unwrap();
        assert_eq!(scene.label_count(), 1);
        assert!(scene.label("first").is_none());

        assert_eq!(
            scene.add_label_for_node(b, "second"),
            Err(SceneError::DuplicateLabel { key: "second".to_string(), owner: a })
        );
        assert!(scene.label_count() <= scene.node_count());
    }

    #[test]
    fn labels_follow_their_node() {
        let mut scene = scene();
        scene.add_label_container();
        let node = scene.add_node_at(Point::new(50.0, 10.0), 2.0, ParticleKind::Beta, 1.0);
        scene.add_label_for_node(node, "k").unwrap();
        assert_eq!(scene.label("k").map(|l| l.position()), Some(Point::new(50.0, 5.0)));
        scene.scroll(1.0, 15.0);
        assert_eq!(scene.label("k").map(|l| l.position()), Some(Point::new(35.0, 5.0)));
    }

    #[test]
    fn removing_twice_is_a_no_op() {
        let mut scene = scene();
        scene.add_label_container();
        let node = scene.add_node_at(Point::new(50.0, 10.0), 2.0, ParticleKind::Beta, 1.0);
        scene.add_label_for_node(node, "k").unwrap();

        assert!(scene.clean_up_children_and_remove(node));
        let after_first = scene.label_count();
        assert!(!scene.clean_up_children_and_remove(node));
        assert_eq!(scene.label_count(), after_first);
        assert_eq!(after_first, 0);
    }

    #[test]
    fn removed_ids_are_never_reused() {
        let mut scene = scene();
        let first = scene.add_node_at(Point::new(50.0, 10.0), 2.0, ParticleKind::Beta, 1.0);
        scene.clean_up_children_and_remove(first);
        let second = scene.add_node_at(Point::new(50.0, 10.0), 2.0, ParticleKind::Beta, 1.0);
        assert!(second > first);
    }

    #[test]
    fn removing_container_drops_all_labels() {
        let mut scene = scene();
        let container = scene.add_label_container();
        let a = scene.add_node_at(Point::new(50.0, 10.0), 2.0, ParticleKind::Beta, 1.0);
        let b = scene.add_node_at(Point::new(70.0, 10.0), 2.0, ParticleKind::Beta, 1.0);
        let label_b = scene.add_label_for_node(b, "b").unwrap();
        scene.add_label_for_node(a, "a").unwrap();

        assert!(scene.clean_up_children_and_remove(label_b));
        assert_eq!(scene.label_count(), 1);
        assert!(scene.node(b).unwrap().label_key().is_none());

        assert!(scene.clean_up_children_and_remove(container));
        assert_eq!(scene.label_count(), 0);
        assert!(!scene.has_label_container());
        assert_eq!(scene.node_count(), 2);
    }

    #[test]
    fn non_finite_scroll_is_ignored() {
        let mut scene = scene();
        scene.scroll(f64::NAN, 10.0);
        scene.scroll(1.0, f64::INFINITY);
        assert_eq!(scene.field().offset(), 0.0);
    }
}
