//! Two-dimensional unstructured meshes with subdomains, tagged boundaries and
//! conforming h-refinement.
//!
//! The mesh is the read-only substrate that the traversal engine in
//! [`crate::loops`] iterates over. During a traversal no topology, subdomain
//! or refinement state may change; mutation (tagging, partitioning,
//! refinement) happens strictly between traversals.

use eyre::{bail, Result};
use nalgebra::{Point2, Vector2};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod range;

/// Stable, process-independent identifier of a mesh element.
///
/// Ids are unique within a mesh but need not be contiguous: refinement
/// allocates fresh ids and repartitioning tools may renumber sparsely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ElementId(pub u64);

/// Identifier of a mesh vertex/node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

/// A user-tagged region of the mesh, used to restrict where physics objects
/// are active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubdomainId(pub u16);

impl SubdomainId {
    /// Sentinel meaning "no subdomain seen yet". Never a legal user id;
    /// the traversal drivers compare against it to detect the first-element
    /// transition.
    pub const INVALID: SubdomainId = SubdomainId(u16::MAX);
}

/// A tag attached to element sides (and the nodes on them) marking a named
/// boundary or internal interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BoundaryId(pub u16);

/// Owning process of an element in a partitioned mesh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProcessorId(pub u32);

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SubdomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BoundaryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A polygonal mesh cell.
///
/// Sides are indexed in local order: side `s` is the edge from vertex `s` to
/// vertex `(s + 1) % n`. The neighbor across a side, if any, is the
/// same-or-coarser-level element sharing that edge; it may itself be
/// inactive when it has been refined away, which is exactly the situation
/// the interior-side ownership rule in [`crate::loops`] arbitrates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Element {
    id: ElementId,
    vertices: Vec<NodeId>,
    subdomain: SubdomainId,
    level: u32,
    active: bool,
    processor: ProcessorId,
    neighbors: Vec<Option<ElementId>>,
    parent: Option<ElementId>,
}

impl Element {
    pub fn id(&self) -> ElementId {
        self.id
    }

    pub fn subdomain_id(&self) -> SubdomainId {
        self.subdomain
    }

    /// Refinement level; root cells are level 0.
    pub fn level(&self) -> u32 {
        self.level
    }

    /// Whether this element is a leaf of the refinement tree. Only active
    /// elements are traversed; inactive ones persist so that neighbor links
    /// across refinement levels stay resolvable.
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn processor(&self) -> ProcessorId {
        self.processor
    }

    pub fn parent(&self) -> Option<ElementId> {
        self.parent
    }

    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    pub fn vertex_ids(&self) -> &[NodeId] {
        &self.vertices
    }

    pub fn num_sides(&self) -> u32 {
        self.vertices.len() as u32
    }

    /// The two nodes of side `side`, in local orientation.
    pub fn side_nodes(&self, side: u32) -> (NodeId, NodeId) {
        let n = self.vertices.len();
        let s = side as usize;
        assert!(s < n, "side index {side} out of bounds for {n}-gon");
        (self.vertices[s], self.vertices[(s + 1) % n])
    }

    /// The element across side `side`, or `None` at a true exterior boundary.
    pub fn neighbor(&self, side: u32) -> Option<ElementId> {
        self.neighbors[side as usize]
    }
}

/// Boundary tags for sides and nodes.
///
/// A side may carry several tags; tag order per side is insertion order and
/// is preserved, since side hooks fire once per tag in that order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BoundaryInfo {
    side_ids: FxHashMap<(ElementId, u32), Vec<BoundaryId>>,
    node_ids: FxHashMap<NodeId, Vec<BoundaryId>>,
}

impl BoundaryInfo {
    fn add_side(&mut self, elem: ElementId, side: u32, boundary: BoundaryId) {
        let tags = self.side_ids.entry((elem, side)).or_default();
        if !tags.contains(&boundary) {
            tags.push(boundary);
        }
    }

    fn add_node(&mut self, node: NodeId, boundary: BoundaryId) {
        let tags = self.node_ids.entry(node).or_default();
        if !tags.contains(&boundary) {
            tags.push(boundary);
        }
    }

    pub fn side_ids(&self, elem: ElementId, side: u32) -> &[BoundaryId] {
        self.side_ids
            .get(&(elem, side))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn node_ids(&self, node: NodeId) -> &[BoundaryId] {
        self.node_ids.get(&node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All nodes carrying the given tag, sorted by id for deterministic
    /// traversal order.
    pub fn nodes_on_boundary(&self, boundary: BoundaryId) -> Vec<NodeId> {
        let mut nodes: Vec<_> = self
            .node_ids
            .iter()
            .filter(|(_, tags)| tags.contains(&boundary))
            .map(|(&node, _)| node)
            .collect();
        nodes.sort_unstable();
        nodes
    }
}

/// An unstructured 2D mesh of polygonal cells.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mesh {
    vertices: Vec<Point2<f64>>,
    elements: Vec<Element>,
    index_by_id: FxHashMap<ElementId, u32>,
    boundary_info: BoundaryInfo,
    node_subdomains: FxHashMap<NodeId, Vec<SubdomainId>>,
    // Midpoint nodes created by refinement, keyed by the (sorted) edge they
    // bisect, so that refining both elements on an edge reuses one node.
    edge_midpoints: FxHashMap<(NodeId, NodeId), NodeId>,
    next_element_id: u64,
}

impl Mesh {
    pub fn builder() -> MeshBuilder {
        MeshBuilder::default()
    }

    /// A 1 x `n` strip of unit quads on a single subdomain, elements numbered
    /// left to right. Convenient for tests and benchmarks.
    pub fn quad_strip(n: usize, subdomain: SubdomainId) -> Mesh {
        let mut builder = MeshBuilder::default();
        let mut bottom = Vec::with_capacity(n + 1);
        let mut top = Vec::with_capacity(n + 1);
        for i in 0..=n {
            bottom.push(builder.add_vertex(Point2::new(i as f64, 0.0)));
            top.push(builder.add_vertex(Point2::new(i as f64, 1.0)));
        }
        for i in 0..n {
            builder.add_cell(&[bottom[i], bottom[i + 1], top[i + 1], top[i]], subdomain);
        }
        builder.build().expect("strip construction cannot fail")
    }

    /// An `nx` x `ny` grid of axis-aligned quads covering `[0, nx] x [0, ny]`,
    /// numbered row-major from the lower-left corner.
    pub fn quad_grid(nx: usize, ny: usize, subdomain: SubdomainId) -> Mesh {
        let mut builder = MeshBuilder::default();
        let mut rows = Vec::with_capacity(ny + 1);
        for j in 0..=ny {
            let mut row = Vec::with_capacity(nx + 1);
            for i in 0..=nx {
                row.push(builder.add_vertex(Point2::new(i as f64, j as f64)));
            }
            rows.push(row);
        }
        for j in 0..ny {
            for i in 0..nx {
                builder.add_cell(
                    &[rows[j][i], rows[j][i + 1], rows[j + 1][i + 1], rows[j + 1][i]],
                    subdomain,
                );
            }
        }
        builder.build().expect("grid construction cannot fail")
    }

    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    /// Total number of element slots, including inactive (refined-away)
    /// parents. Dense per-element storage such as indicator fields is sized
    /// by this.
    pub fn num_element_slots(&self) -> usize {
        self.elements.len()
    }

    pub fn vertex(&self, node: NodeId) -> &Point2<f64> {
        &self.vertices[node.0 as usize]
    }

    pub fn element(&self, id: ElementId) -> &Element {
        let index = self.index_by_id[&id];
        &self.elements[index as usize]
    }

    /// Dense storage index of an element, stable for the lifetime of the
    /// mesh (refinement appends, never reorders).
    pub fn element_index(&self, id: ElementId) -> usize {
        self.index_by_id[&id] as usize
    }

    pub fn contains_element(&self, id: ElementId) -> bool {
        self.index_by_id.contains_key(&id)
    }

    pub fn boundary_info(&self) -> &BoundaryInfo {
        &self.boundary_info
    }

    pub fn boundary_ids_for_side(&self, elem: ElementId, side: u32) -> &[BoundaryId] {
        self.boundary_info.side_ids(elem, side)
    }

    /// Active elements owned by `processor`, in ascending id order. This is
    /// the canonical element traversal population for one process.
    pub fn active_local_elements(&self, processor: ProcessorId) -> Vec<ElementId> {
        let mut ids: Vec<_> = self
            .elements
            .iter()
            .filter(|e| e.active && e.processor == processor)
            .map(|e| e.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Nodes referenced by the active elements owned by `processor`, sorted
    /// and deduplicated. The node traversal population for nodal loops.
    pub fn local_nodes(&self, processor: ProcessorId) -> Vec<NodeId> {
        let mut nodes: Vec<_> = self
            .elements
            .iter()
            .filter(|e| e.active && e.processor == processor)
            .flat_map(|e| e.vertices.iter().copied())
            .collect();
        nodes.sort_unstable();
        nodes.dedup();
        nodes
    }

    /// Subdomains of the active elements a node belongs to.
    pub fn node_subdomains(&self, node: NodeId) -> &[SubdomainId] {
        self.node_subdomains
            .get(&node)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// All subdomain ids present on active elements, sorted.
    pub fn subdomain_ids(&self) -> Vec<SubdomainId> {
        let mut ids: Vec<_> = self
            .elements
            .iter()
            .filter(|e| e.active)
            .map(|e| e.subdomain)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// All boundary ids attached to any side or node, sorted.
    pub fn all_boundary_ids(&self) -> Vec<BoundaryId> {
        let mut ids: Vec<_> = self
            .boundary_info
            .side_ids
            .values()
            .chain(self.boundary_info.node_ids.values())
            .flatten()
            .copied()
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Polygon area of the element (shoelace formula).
    pub fn element_measure(&self, id: ElementId) -> f64 {
        let elem = self.element(id);
        let mut twice_area = 0.0;
        let n = elem.vertices.len();
        for s in 0..n {
            let a = self.vertex(elem.vertices[s]);
            let b = self.vertex(elem.vertices[(s + 1) % n]);
            twice_area += a.x * b.y - b.x * a.y;
        }
        0.5 * twice_area.abs()
    }

    pub fn element_centroid(&self, id: ElementId) -> Point2<f64> {
        let elem = self.element(id);
        let mut sum = Vector2::zeros();
        for &v in &elem.vertices {
            sum += self.vertex(v).coords;
        }
        Point2::from(sum / elem.vertices.len() as f64)
    }

    pub fn side_length(&self, id: ElementId, side: u32) -> f64 {
        let (a, b) = self.element(id).side_nodes(side);
        (self.vertex(b) - self.vertex(a)).norm()
    }

    pub fn side_midpoint(&self, id: ElementId, side: u32) -> Point2<f64> {
        let (a, b) = self.element(id).side_nodes(side);
        nalgebra::center(self.vertex(a), self.vertex(b))
    }

    /// Outward unit normal of a side. Relies on the counter-clockwise cell
    /// orientation enforced at build time.
    pub fn side_normal(&self, id: ElementId, side: u32) -> Vector2<f64> {
        let (a, b) = self.element(id).side_nodes(side);
        let edge = self.vertex(b) - self.vertex(a);
        Vector2::new(edge.y, -edge.x) / edge.norm()
    }

    /// Attach a boundary tag to `(elem, side)` and to the nodes on that side.
    pub fn tag_side(&mut self, elem: ElementId, side: u32, boundary: BoundaryId) {
        let (a, b) = self.element(elem).side_nodes(side);
        self.boundary_info.add_side(elem, side, boundary);
        self.boundary_info.add_node(a, boundary);
        self.boundary_info.add_node(b, boundary);
    }

    /// Attach a boundary tag to every side of every active element that lies
    /// on the mesh exterior (no neighbor).
    pub fn tag_exterior(&mut self, boundary: BoundaryId) {
        let exterior: Vec<(ElementId, u32)> = self
            .elements
            .iter()
            .filter(|e| e.active)
            .flat_map(|e| {
                (0..e.num_sides())
                    .filter(|&s| e.neighbor(s).is_none())
                    .map(move |s| (e.id, s))
            })
            .collect();
        for (elem, side) in exterior {
            self.tag_side(elem, side, boundary);
        }
    }

    pub fn set_processor(&mut self, elem: ElementId, processor: ProcessorId) {
        let index = self.index_by_id[&elem];
        self.elements[index as usize].processor = processor;
    }

    pub fn set_subdomain(&mut self, elem: ElementId, subdomain: SubdomainId) {
        assert_ne!(subdomain, SubdomainId::INVALID, "reserved subdomain id");
        let index = self.index_by_id[&elem];
        self.elements[index as usize].subdomain = subdomain;
        self.rebuild_node_subdomains();
    }

    /// Conformally refine a quad element into four children at the next
    /// level.
    ///
    /// The parent becomes inactive but is kept: neighbor links of adjacent
    /// elements continue to reference it, per the same-or-coarser neighbor
    /// convention. Children inherit the parent's outer neighbors, subdomain,
    /// processor and side tags, and pair up across the four interior sides.
    ///
    /// Must not be called during a traversal; refinement driven by markers
    /// is staged and applied between traversals.
    pub fn refine(&mut self, id: ElementId) -> Result<[ElementId; 4]> {
        let parent_index = match self.index_by_id.get(&id) {
            Some(&index) => index as usize,
            None => bail!("cannot refine unknown element {id}"),
        };
        {
            let parent = &self.elements[parent_index];
            if !parent.active {
                bail!("cannot refine inactive element {id}");
            }
            if parent.vertices.len() != 4 {
                bail!(
                    "refinement only supports quads; element {id} has {} vertices",
                    parent.vertices.len()
                );
            }
        }

        let parent = self.elements[parent_index].clone();
        let [v0, v1, v2, v3] = [
            parent.vertices[0],
            parent.vertices[1],
            parent.vertices[2],
            parent.vertices[3],
        ];
        let m01 = self.midpoint_node(v0, v1);
        let m12 = self.midpoint_node(v1, v2);
        let m23 = self.midpoint_node(v2, v3);
        let m30 = self.midpoint_node(v3, v0);
        let center = self.push_vertex(Point2::from(
            (self.vertex(v0).coords
                + self.vertex(v1).coords
                + self.vertex(v2).coords
                + self.vertex(v3).coords)
                / 4.0,
        ));

        let child_ids = [
            ElementId(self.next_element_id),
            ElementId(self.next_element_id + 1),
            ElementId(self.next_element_id + 2),
            ElementId(self.next_element_id + 3),
        ];
        self.next_element_id += 4;
        let [c0, c1, c2, c3] = child_ids;

        // Child k keeps the parent's corner k; parent side k is split between
        // children k and (k + 1) % 4, both on their local side k.
        let children_vertices = [
            vec![v0, m01, center, m30],
            vec![m01, v1, m12, center],
            vec![center, m12, v2, m23],
            vec![m30, center, m23, v3],
        ];
        let outer = |side: u32| parent.neighbors[side as usize];
        let children_neighbors = [
            vec![outer(0), Some(c1), Some(c3), outer(3)],
            vec![outer(0), outer(1), Some(c2), Some(c0)],
            vec![Some(c1), outer(1), outer(2), Some(c3)],
            vec![Some(c0), Some(c2), outer(2), outer(3)],
        ];

        for (k, (vertices, neighbors)) in children_vertices
            .into_iter()
            .zip(children_neighbors)
            .enumerate()
        {
            let child = Element {
                id: child_ids[k],
                vertices,
                subdomain: parent.subdomain,
                level: parent.level + 1,
                active: true,
                processor: parent.processor,
                neighbors,
                parent: Some(parent.id),
            };
            self.index_by_id.insert(child.id, self.elements.len() as u32);
            self.elements.push(child);
        }

        // Parent side tags carry over to the two child sides covering them.
        for side in 0..4u32 {
            let tags: Vec<BoundaryId> = self.boundary_info.side_ids(id, side).to_vec();
            for boundary in tags {
                self.tag_side(child_ids[side as usize], side, boundary);
                self.tag_side(child_ids[(side as usize + 1) % 4], side, boundary);
            }
        }

        self.elements[parent_index].active = false;
        self.rebuild_node_subdomains();
        Ok(child_ids)
    }

    fn push_vertex(&mut self, point: Point2<f64>) -> NodeId {
        let node = NodeId(self.vertices.len() as u32);
        self.vertices.push(point);
        node
    }

    fn midpoint_node(&mut self, a: NodeId, b: NodeId) -> NodeId {
        let key = if a <= b { (a, b) } else { (b, a) };
        if let Some(&node) = self.edge_midpoints.get(&key) {
            return node;
        }
        let point = nalgebra::center(self.vertex(a), self.vertex(b));
        let node = self.push_vertex(point);
        self.edge_midpoints.insert(key, node);
        node
    }

    fn rebuild_node_subdomains(&mut self) {
        self.node_subdomains.clear();
        for index in 0..self.elements.len() {
            if !self.elements[index].active {
                continue;
            }
            let subdomain = self.elements[index].subdomain;
            for v in 0..self.elements[index].vertices.len() {
                let node = self.elements[index].vertices[v];
                let subdomains = self.node_subdomains.entry(node).or_default();
                if !subdomains.contains(&subdomain) {
                    subdomains.push(subdomain);
                }
            }
        }
        for subdomains in self.node_subdomains.values_mut() {
            subdomains.sort_unstable();
        }
    }
}

/// Incremental mesh construction with validation.
#[derive(Debug, Default)]
pub struct MeshBuilder {
    vertices: Vec<Point2<f64>>,
    cells: Vec<(Vec<NodeId>, SubdomainId)>,
    explicit_ids: Option<Vec<ElementId>>,
}

impl MeshBuilder {
    pub fn add_vertex(&mut self, point: Point2<f64>) -> NodeId {
        let node = NodeId(self.vertices.len() as u32);
        self.vertices.push(point);
        node
    }

    /// Add a cell with counter-clockwise vertex order. Returns the position
    /// of the cell, which becomes its element id unless overridden by
    /// [`MeshBuilder::element_ids`].
    pub fn add_cell(&mut self, vertices: &[NodeId], subdomain: SubdomainId) -> usize {
        self.cells.push((vertices.to_vec(), subdomain));
        self.cells.len() - 1
    }

    /// Override the default sequential element numbering. Partitioned meshes
    /// carry sparse, renumbered ids; tests use this to pin specific ids.
    pub fn element_ids(&mut self, ids: Vec<ElementId>) -> &mut Self {
        self.explicit_ids = Some(ids);
        self
    }

    pub fn build(self) -> Result<Mesh> {
        let ids = match &self.explicit_ids {
            Some(ids) => {
                if ids.len() != self.cells.len() {
                    bail!(
                        "{} element ids supplied for {} cells",
                        ids.len(),
                        self.cells.len()
                    );
                }
                ids.clone()
            }
            None => (0..self.cells.len() as u64).map(ElementId).collect(),
        };

        let mut index_by_id = FxHashMap::default();
        for (position, &id) in ids.iter().enumerate() {
            if index_by_id.insert(id, position as u32).is_some() {
                bail!("duplicate element id {id}");
            }
        }

        let mut elements = Vec::with_capacity(self.cells.len());
        for (position, (vertices, subdomain)) in self.cells.iter().enumerate() {
            if vertices.len() < 3 {
                bail!("cell {position} has fewer than 3 vertices");
            }
            if *subdomain == SubdomainId::INVALID {
                bail!("cell {position} uses the reserved subdomain id");
            }
            for &node in vertices {
                if node.0 as usize >= self.vertices.len() {
                    bail!("cell {position} references unknown vertex {}", node.0);
                }
            }
            if signed_area(&self.vertices, vertices) <= 0.0 {
                bail!("cell {position} is not counter-clockwise (or degenerate)");
            }
            let num_sides = vertices.len();
            elements.push(Element {
                id: ids[position],
                vertices: vertices.clone(),
                subdomain: *subdomain,
                level: 0,
                active: true,
                processor: ProcessorId::default(),
                neighbors: vec![None; num_sides],
                parent: None,
            });
        }

        resolve_neighbors(&mut elements)?;

        let next_element_id = ids.iter().map(|id| id.0 + 1).max().unwrap_or(0);
        let mut mesh = Mesh {
            vertices: self.vertices,
            elements,
            index_by_id,
            boundary_info: BoundaryInfo::default(),
            node_subdomains: FxHashMap::default(),
            edge_midpoints: FxHashMap::default(),
            next_element_id,
        };
        mesh.rebuild_node_subdomains();
        Ok(mesh)
    }
}

fn signed_area(vertices: &[Point2<f64>], cell: &[NodeId]) -> f64 {
    let mut twice_area = 0.0;
    let n = cell.len();
    for s in 0..n {
        let a = &vertices[cell[s].0 as usize];
        let b = &vertices[cell[(s + 1) % n].0 as usize];
        twice_area += a.x * b.y - b.x * a.y;
    }
    0.5 * twice_area
}

/// Match element sides that share an edge and link them as neighbors.
///
/// Each side is keyed by its sorted node pair; a key seen exactly twice is an
/// interior edge, a key seen once is exterior, and anything more is
/// non-manifold and rejected.
fn resolve_neighbors(elements: &mut [Element]) -> Result<()> {
    let mut edge_map: FxHashMap<(NodeId, NodeId), Vec<(usize, u32)>> = FxHashMap::default();

    for (index, elem) in elements.iter().enumerate() {
        for side in 0..elem.num_sides() {
            let (a, b) = elem.side_nodes(side);
            let key = if a <= b { (a, b) } else { (b, a) };
            edge_map.entry(key).or_default().push((index, side));
        }
    }

    for (key, sides) in edge_map {
        match sides.as_slice() {
            [_] => {}
            &[(i, si), (j, sj)] => {
                let id_i = elements[i].id;
                let id_j = elements[j].id;
                elements[i].neighbors[si as usize] = Some(id_j);
                elements[j].neighbors[sj as usize] = Some(id_i);
            }
            _ => bail!(
                "edge ({}, {}) is shared by more than two cells",
                key.0 .0,
                key.1 .0
            ),
        }
    }
    Ok(())
}
