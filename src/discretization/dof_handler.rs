use crate::discretization::fe::FeSystem;
use crate::discretization::mesh::{Mesh, Point};
use std::collections::{BTreeSet, HashMap};
use std::ops::Range;

/// Global numbering of the velocity-pressure unknowns.
///
/// Nodes are shared between cells through the sorted vertex set of the entity
/// they sit on. Every node carries `DIM + 1` dofs, so global dof
/// `node * (DIM + 1) + component`. Nodes are numbered by owning subdomain, which
/// keeps each rank's owned dofs contiguous.
#[derive(Debug, Clone)]
pub struct DofHandler<const DIM: usize> {
    cell_nodes: Vec<Vec<usize>>,
    node_points: Vec<Point<DIM>>,
    node_owner: Vec<usize>,
    owned_nodes: Vec<Range<usize>>,
}

impl<const DIM: usize> DofHandler<DIM> {
    pub fn distribute(mesh: &Mesh<DIM>, fe: &FeSystem<DIM>) -> Self {
        let n_cell_nodes = fe.nodes_per_cell();
        let mut keys: HashMap<Vec<usize>, usize> = HashMap::new();
        let mut points: Vec<Point<DIM>> = Vec::new();
        let mut owner: Vec<usize> = Vec::new();
        let mut provisional: Vec<Vec<usize>> = Vec::with_capacity(mesh.n_cells());

        let entities: Vec<Vec<usize>> = (0..n_cell_nodes).map(|n| fe.support_entity(n)).collect();

        for cell in &mesh.cells {
            let vertices = mesh.cell_vertices(cell.id);
            let mut nodes = Vec::with_capacity(n_cell_nodes);
            for (n, entity) in entities.iter().enumerate() {
                let mut key: Vec<usize> = entity.iter().map(|&v| cell.vertex_ids[v]).collect();
                key.sort_unstable();
                let next = points.len();
                let id = *keys.entry(key).or_insert(next);
                if id == next {
                    let xi = fe.node_reference_point(n);
                    points.push(crate::discretization::mapping::map_to_real(&vertices, &xi));
                    owner.push(cell.subdomain);
                } else {
                    owner[id] = owner[id].min(cell.subdomain);
                }
                nodes.push(id);
            }
            provisional.push(nodes);
        }

        // stable renumbering by owner
        let mut order: Vec<usize> = (0..points.len()).collect();
        order.sort_by_key(|&n| owner[n]);
        let mut new_id = vec![0usize; points.len()];
        for (new, &old) in order.iter().enumerate() {
            new_id[old] = new;
        }

        let node_points = order.iter().map(|&old| points[old]).collect();
        let node_owner: Vec<usize> = order.iter().map(|&old| owner[old]).collect();
        let cell_nodes = provisional
            .into_iter()
            .map(|nodes| nodes.into_iter().map(|n| new_id[n]).collect())
            .collect();

        let n_ranks = mesh.n_subdomains();
        let owned_nodes = (0..n_ranks)
            .map(|r| {
                let start = node_owner.partition_point(|&o| o < r);
                let end = node_owner.partition_point(|&o| o <= r);
                start..end
            })
            .collect();

        Self {
            cell_nodes,
            node_points,
            node_owner,
            owned_nodes,
        }
    }

    pub const fn n_components() -> usize {
        DIM + 1
    }

    pub fn n_nodes(&self) -> usize {
        self.node_points.len()
    }

    pub fn n_dofs(&self) -> usize {
        self.n_nodes() * (DIM + 1)
    }

    #[inline]
    pub fn dof(&self, node: usize, component: usize) -> usize {
        node * (DIM + 1) + component
    }

    #[inline]
    pub fn node_of(&self, dof: usize) -> usize {
        dof / (DIM + 1)
    }

    #[inline]
    pub fn component_of(&self, dof: usize) -> usize {
        dof % (DIM + 1)
    }

    pub fn cell_nodes(&self, cell: usize) -> &[usize] {
        &self.cell_nodes[cell]
    }

    /// Global dofs of a cell in local (`node * (DIM + 1) + component`) order.
    pub fn cell_dofs(&self, cell: usize) -> Vec<usize> {
        self.cell_nodes[cell]
            .iter()
            .flat_map(|&n| (0..=DIM).map(move |c| n * (DIM + 1) + c))
            .collect()
    }

    pub fn node_point(&self, node: usize) -> &Point<DIM> {
        &self.node_points[node]
    }

    pub fn support_point(&self, dof: usize) -> &Point<DIM> {
        &self.node_points[self.node_of(dof)]
    }

    pub fn node_owner(&self, node: usize) -> usize {
        self.node_owner[node]
    }

    pub fn locally_owned_dofs(&self, rank: usize) -> Range<usize> {
        match self.owned_nodes.get(rank) {
            Some(r) => r.start * (DIM + 1)..r.end * (DIM + 1),
            None => 0..0,
        }
    }

    /// Owned dofs plus every dof touched by an owned cell.
    pub fn locally_relevant_dofs(&self, mesh: &Mesh<DIM>, rank: usize) -> BTreeSet<usize> {
        let mut set: BTreeSet<usize> = self.locally_owned_dofs(rank).collect();
        for cell in mesh.locally_owned_cells(rank) {
            set.extend(self.cell_dofs(cell.id));
        }
        set
    }

    /// Nodes lying on faces carrying `boundary_id`.
    pub fn boundary_nodes(&self, mesh: &Mesh<DIM>, fe: &FeSystem<DIM>, boundary_id: u32) -> BTreeSet<usize> {
        let mut set = BTreeSet::new();
        for cell in &mesh.cells {
            for (face, id) in cell.face_boundary_ids.iter().enumerate() {
                if *id == Some(boundary_id) {
                    set.extend(fe.face_nodes(face).into_iter().map(|n| self.cell_nodes[cell.id][n]));
                }
            }
        }
        set
    }

    /// One mask per component; used as near-null-space information by AMG.
    pub fn constant_modes(&self) -> Vec<Vec<bool>> {
        (0..=DIM)
            .map(|c| (0..self.n_dofs()).map(|d| self.component_of(d) == c).collect())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discretization::generator::{hyper_cube, partition_cells};

    #[test]
    fn counts_for_q1_and_q2() {
        let mesh = hyper_cube::<2>(3, 0.0, 1.0, true);
        let q1 = DofHandler::distribute(&mesh, &FeSystem::<2>::new(1));
        assert_eq!(q1.n_nodes(), 16);
        assert_eq!(q1.n_dofs(), 48);
        let q2 = DofHandler::distribute(&mesh, &FeSystem::<2>::new(2));
        assert_eq!(q2.n_nodes(), 49);

        let mesh3 = hyper_cube::<3>(2, 0.0, 1.0, true);
        let q2 = DofHandler::distribute(&mesh3, &FeSystem::<3>::new(2));
        assert_eq!(q2.n_nodes(), 125);
        assert_eq!(q2.n_dofs(), 500);
    }

    #[test]
    fn shared_nodes_have_matching_support_points() {
        let mesh = hyper_cube::<2>(2, 0.0, 1.0, true);
        let fe = FeSystem::<2>::new(2);
        let dh = DofHandler::distribute(&mesh, &fe);
        // right edge of cell 0 equals left edge of cell 1
        let right: Vec<usize> = fe.face_nodes(1).iter().map(|&n| dh.cell_nodes(0)[n]).collect();
        let left: Vec<usize> = fe.face_nodes(0).iter().map(|&n| dh.cell_nodes(1)[n]).collect();
        assert_eq!(right, left);
        let p = dh.node_point(right[1]);
        assert!((p[0] - 0.5).abs() < 1e-14 && (p[1] - 0.25).abs() < 1e-14);
        assert_eq!(dh.boundary_nodes(&mesh, &fe, 2).len(), 5);
    }

    #[test]
    fn owned_ranges_partition_the_dofs() {
        let mut mesh = hyper_cube::<2>(4, 0.0, 1.0, false);
        partition_cells(&mut mesh, 2);
        let dh = DofHandler::distribute(&mesh, &FeSystem::<2>::new(1));
        let a = dh.locally_owned_dofs(0);
        let b = dh.locally_owned_dofs(1);
        assert_eq!(a.start, 0);
        assert_eq!(a.end, b.start);
        assert_eq!(b.end, dh.n_dofs());
        assert!(dh.locally_relevant_dofs(&mesh, 1).len() > b.len());
    }
}
