use crate::discretization::mapping;
use crate::discretization::quadrature::QGauss;
use nalgebra::SVector;
use std::collections::BTreeSet;

pub type Point<const DIM: usize> = SVector<f64, DIM>;

/// A quadrilateral/hexahedral element. Vertices follow the tensor-product
/// ordering: bit `a` of the local vertex index selects the side along axis `a`.
#[derive(Debug, Clone)]
pub struct Cell {
    pub id: usize,
    pub vertex_ids: Vec<usize>,
    /// One entry per face (`2 * axis + side`), `None` for interior faces.
    pub face_boundary_ids: Vec<Option<u32>>,
    /// Rank that owns this cell in a partitioned run.
    pub subdomain: usize,
}

impl Cell {
    pub fn at_boundary(&self) -> bool {
        self.face_boundary_ids.iter().any(Option::is_some)
    }
}

/// The complete computational grid.
#[derive(Debug, Clone)]
pub struct Mesh<const DIM: usize> {
    pub vertices: Vec<Point<DIM>>,
    pub cells: Vec<Cell>,
}

/// For every vertex, the sorted handles of the cells touching it.
#[derive(Debug, Clone, Default)]
pub struct VertexCellMap {
    cells: Vec<Vec<usize>>,
}

impl VertexCellMap {
    pub fn cells_of(&self, vertex: usize) -> &[usize] {
        self.cells.get(vertex).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// Local vertex indices of face `face` (`2 * axis + side`).
pub fn face_local_vertices(dim: usize, face: usize) -> Vec<usize> {
    let axis = face / 2;
    let side = face % 2;
    (0..1usize << dim)
        .filter(|v| (v >> axis) & 1 == side)
        .collect()
}

impl<const DIM: usize> Mesh<DIM> {
    pub const VERTICES_PER_CELL: usize = 1 << DIM;
    pub const FACES_PER_CELL: usize = 2 * DIM;

    pub fn n_cells(&self) -> usize {
        self.cells.len()
    }

    pub fn n_vertices(&self) -> usize {
        self.vertices.len()
    }

    pub fn cell_vertices(&self, cell: usize) -> Vec<Point<DIM>> {
        self.cells[cell]
            .vertex_ids
            .iter()
            .map(|&v| self.vertices[v])
            .collect()
    }

    pub fn locally_owned_cells(&self, rank: usize) -> impl Iterator<Item = &Cell> {
        self.cells.iter().filter(move |c| c.subdomain == rank)
    }

    /// Cell measure (area in 2D, volume in 3D).
    pub fn measure(&self, cell: usize) -> f64 {
        let vertices = self.cell_vertices(cell);
        let quad = QGauss::<DIM>::new(2);
        quad.points
            .iter()
            .zip(&quad.weights)
            .map(|(xi, w)| mapping::determinant(&mapping::jacobian(&vertices, xi)).abs() * w)
            .sum()
    }

    pub fn center(&self, cell: usize) -> Point<DIM> {
        let vertices = self.cell_vertices(cell);
        mapping::map_to_real(&vertices, &Point::<DIM>::repeat(0.5))
    }

    /// Smallest edge length of the cell.
    pub fn min_edge_length(&self, cell: usize) -> f64 {
        let ids = &self.cells[cell].vertex_ids;
        let mut h = f64::MAX;
        for v in 0..ids.len() {
            for axis in 0..DIM {
                if (v >> axis) & 1 == 0 {
                    let w = v | (1 << axis);
                    h = h.min((self.vertices[ids[w]] - self.vertices[ids[v]]).norm());
                }
            }
        }
        h
    }

    pub fn vertex_to_cells(&self) -> VertexCellMap {
        let mut sets = vec![BTreeSet::new(); self.vertices.len()];
        for cell in &self.cells {
            for &v in &cell.vertex_ids {
                sets[v].insert(cell.id);
            }
        }
        VertexCellMap {
            cells: sets.into_iter().map(|s| s.into_iter().collect()).collect(),
        }
    }

    pub fn face_vertex_ids(&self, cell: usize, face: usize) -> Vec<usize> {
        face_local_vertices(DIM, face)
            .into_iter()
            .map(|v| self.cells[cell].vertex_ids[v])
            .collect()
    }

    /// Outward unit normal of a face, evaluated at the face center.
    pub fn face_normal(&self, cell: usize, face: usize) -> Point<DIM> {
        let axis = face / 2;
        let side = face % 2;
        let vertices = self.cell_vertices(cell);
        let mut xi = Point::<DIM>::repeat(0.5);
        xi[axis] = side as f64;
        let jac = mapping::jacobian(&vertices, &xi);
        let mut e = Point::<DIM>::zeros();
        e[axis] = if side == 1 { 1.0 } else { -1.0 };
        let n = match mapping::inverse(&jac) {
            Some(inv) => inv.transpose() * e,
            None => e,
        };
        n.normalize()
    }

    pub fn boundary_ids(&self) -> BTreeSet<u32> {
        self.cells
            .iter()
            .flat_map(|c| c.face_boundary_ids.iter().flatten().copied())
            .collect()
    }

    pub fn n_subdomains(&self) -> usize {
        self.cells.iter().map(|c| c.subdomain + 1).max().unwrap_or(1)
    }

    /// Applies `f` to every vertex, e.g. to distort a structured grid.
    pub fn transform(&mut self, f: impl Fn(&Point<DIM>) -> Point<DIM>) {
        for v in self.vertices.iter_mut() {
            *v = f(v);
        }
    }

    pub fn total_measure(&self) -> f64 {
        (0..self.n_cells()).map(|c| self.measure(c)).sum()
    }
}
