//! Equal-order Lagrange `Q_k` system carrying `DIM` velocity components and one
//! pressure component on every node.

use crate::discretization::mapping::{self, MappingError, Tensor2};
use crate::discretization::mesh::Point;
use crate::discretization::quadrature::QGauss;

#[derive(Debug, Clone)]
pub struct FeSystem<const DIM: usize> {
    pub degree: usize,
    nodes_1d: Vec<f64>,
    /// Per-node multi-index, first axis fastest.
    node_index: Vec<[usize; DIM]>,
}

/// One-dimensional Lagrange polynomial `j` on `nodes`, with its first two derivatives.
fn lagrange_1d(nodes: &[f64], j: usize, x: f64) -> (f64, f64, f64) {
    let n = nodes.len();
    let factor = |m: usize| (x - nodes[m]) / (nodes[j] - nodes[m]);
    let value: f64 = (0..n).filter(|&m| m != j).map(factor).product();

    let mut d1 = 0.0;
    let mut d2 = 0.0;
    for l in (0..n).filter(|&l| l != j) {
        let inv_l = 1.0 / (nodes[j] - nodes[l]);
        d1 += inv_l
            * (0..n)
                .filter(|&m| m != j && m != l)
                .map(factor)
                .product::<f64>();
        for r in (0..n).filter(|&r| r != j && r != l) {
            let inv_r = 1.0 / (nodes[j] - nodes[r]);
            d2 += inv_l
                * inv_r
                * (0..n)
                    .filter(|&m| m != j && m != l && m != r)
                    .map(factor)
                    .product::<f64>();
        }
    }
    (value, d1, d2)
}

impl<const DIM: usize> FeSystem<DIM> {
    pub fn new(degree: usize) -> Self {
        let degree = degree.max(1);
        let nodes_1d = (0..=degree).map(|j| j as f64 / degree as f64).collect();
        let n1 = degree + 1;
        let node_index = (0..n1.pow(DIM as u32))
            .map(|idx| {
                let mut multi = [0usize; DIM];
                let mut rem = idx;
                for m in multi.iter_mut() {
                    *m = rem % n1;
                    rem /= n1;
                }
                multi
            })
            .collect();
        Self {
            degree,
            nodes_1d,
            node_index,
        }
    }

    pub const fn n_components() -> usize {
        DIM + 1
    }

    pub fn nodes_per_cell(&self) -> usize {
        self.node_index.len()
    }

    pub fn dofs_per_cell(&self) -> usize {
        self.nodes_per_cell() * (DIM + 1)
    }

    /// `(component, node)` of a local dof.
    #[inline]
    pub fn system_to_component(&self, local_dof: usize) -> (usize, usize) {
        (local_dof % (DIM + 1), local_dof / (DIM + 1))
    }

    pub fn node_index(&self, node: usize) -> &[usize; DIM] {
        &self.node_index[node]
    }

    pub fn node_reference_point(&self, node: usize) -> Point<DIM> {
        Point::<DIM>::from_fn(|a, _| self.nodes_1d[self.node_index[node][a]])
    }

    /// Cell vertex nearest to a node; the node's own vertex for vertex nodes.
    pub fn closest_vertex(&self, node: usize) -> usize {
        (0..DIM)
            .map(|a| usize::from(2 * self.node_index[node][a] >= self.degree) << a)
            .sum()
    }

    /// Local vertices of the lowest-dimensional entity the node sits on.
    pub fn support_entity(&self, node: usize) -> Vec<usize> {
        let multi = self.node_index[node];
        (0..1usize << DIM)
            .filter(|v| {
                (0..DIM).all(|a| {
                    let bit = (v >> a) & 1;
                    match multi[a] {
                        0 => bit == 0,
                        i if i == self.degree => bit == 1,
                        _ => true,
                    }
                })
            })
            .collect()
    }

    /// Nodes lying on face `face` (`2 * axis + side`).
    pub fn face_nodes(&self, face: usize) -> Vec<usize> {
        let (axis, side) = (face / 2, face % 2);
        let target = side * self.degree;
        (0..self.nodes_per_cell())
            .filter(|&n| self.node_index[n][axis] == target)
            .collect()
    }

    pub fn shape_value(&self, node: usize, xi: &Point<DIM>) -> f64 {
        (0..DIM)
            .map(|a| lagrange_1d(&self.nodes_1d, self.node_index[node][a], xi[a]).0)
            .product()
    }

    pub fn shape_grad_ref(&self, node: usize, xi: &Point<DIM>) -> Point<DIM> {
        let tab = self.tabulate_1d(node, xi);
        Point::<DIM>::from_fn(|b, _| {
            (0..DIM)
                .map(|a| if a == b { tab[a].1 } else { tab[a].0 })
                .product()
        })
    }

    pub fn shape_hessian_ref(&self, node: usize, xi: &Point<DIM>) -> Tensor2<DIM> {
        let tab = self.tabulate_1d(node, xi);
        Tensor2::<DIM>::from_fn(|b, c| {
            (0..DIM)
                .map(|a| match (a == b, a == c) {
                    (true, true) => tab[a].2,
                    (true, false) | (false, true) => tab[a].1,
                    (false, false) => tab[a].0,
                })
                .product()
        })
    }

    fn tabulate_1d(&self, node: usize, xi: &Point<DIM>) -> [(f64, f64, f64); DIM] {
        let mut tab = [(0.0, 0.0, 0.0); DIM];
        for (a, t) in tab.iter_mut().enumerate() {
            *t = lagrange_1d(&self.nodes_1d, self.node_index[node][a], xi[a]);
        }
        tab
    }

    /// Reference-cell shape data at every quadrature point.
    pub fn tabulate(&self, quadrature: &QGauss<DIM>) -> ShapeTable<DIM> {
        let n = self.nodes_per_cell();
        let data = quadrature
            .points
            .iter()
            .map(|xi| {
                (0..n)
                    .map(|node| ShapeData {
                        value: self.shape_value(node, xi),
                        grad: self.shape_grad_ref(node, xi),
                        hessian: self.shape_hessian_ref(node, xi),
                    })
                    .collect()
            })
            .collect();
        ShapeTable { data }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ShapeData<const DIM: usize> {
    pub value: f64,
    pub grad: Point<DIM>,
    pub hessian: Tensor2<DIM>,
}

/// `data[q][node]` on the reference cell.
#[derive(Debug, Clone)]
pub struct ShapeTable<const DIM: usize> {
    pub data: Vec<Vec<ShapeData<DIM>>>,
}

/// Shape data mapped onto one physical cell.
#[derive(Debug, Clone)]
pub struct FeValues<const DIM: usize> {
    pub jxw: Vec<f64>,
    pub points: Vec<Point<DIM>>,
    /// `shape[q][node]` with real-space gradients and Hessians.
    pub shape: Vec<Vec<ShapeData<DIM>>>,
}

impl<const DIM: usize> FeValues<DIM> {
    pub fn reinit(
        table: &ShapeTable<DIM>,
        quadrature: &QGauss<DIM>,
        vertices: &[Point<DIM>],
    ) -> Result<Self, MappingError> {
        let n_q = quadrature.size();
        let mut jxw = Vec::with_capacity(n_q);
        let mut points = Vec::with_capacity(n_q);
        let mut shape = Vec::with_capacity(n_q);

        for (q, xi) in quadrature.points.iter().enumerate() {
            let jac = mapping::jacobian(vertices, xi);
            let det = mapping::determinant(&jac);
            if det <= 0.0 || !det.is_finite() {
                return Err(MappingError::DegenerateCell { det });
            }
            let inv = mapping::inverse(&jac).ok_or(MappingError::DegenerateCell { det })?;
            let inv_t = inv.transpose();
            let d2x = mapping::jacobian_grad(vertices, xi);

            jxw.push(det * quadrature.weights[q]);
            points.push(mapping::map_to_real(vertices, xi));
            shape.push(
                table.data[q]
                    .iter()
                    .map(|s| {
                        let grad = inv_t * s.grad;
                        let mut h_ref = s.hessian;
                        for (a, d2) in d2x.iter().enumerate() {
                            h_ref -= d2 * grad[a];
                        }
                        ShapeData {
                            value: s.value,
                            grad,
                            hessian: inv_t * h_ref * inv,
                        }
                    })
                    .collect(),
            );
        }

        Ok(Self { jxw, points, shape })
    }

    pub fn n_quadrature_points(&self) -> usize {
        self.jxw.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn shape_functions_are_nodal_and_sum_to_one() {
        let fe = FeSystem::<2>::new(2);
        assert_eq!(fe.nodes_per_cell(), 9);
        assert_eq!(fe.dofs_per_cell(), 27);
        let xi = Point::<2>::new(0.21, 0.67);
        let sum: f64 = (0..9).map(|n| fe.shape_value(n, &xi)).sum();
        assert_relative_eq!(sum, 1.0, epsilon = 1e-14);
        let grad_sum = (0..9).fold(Point::<2>::zeros(), |acc, n| acc + fe.shape_grad_ref(n, &xi));
        assert_relative_eq!(grad_sum.norm(), 0.0, epsilon = 1e-13);
        for n in 0..9 {
            let p = fe.node_reference_point(n);
            for m in 0..9 {
                let expected = if n == m { 1.0 } else { 0.0 };
                assert_relative_eq!(fe.shape_value(m, &p), expected, epsilon = 1e-14);
            }
        }
    }

    #[test]
    fn real_hessian_reproduces_quadratic_on_parallelogram() {
        // x^2 stays in the mapped Q2 space only for affine maps
        let vertices = vec![
            Point::<2>::new(0.0, 0.0),
            Point::<2>::new(1.0, 0.3),
            Point::<2>::new(0.4, 1.0),
            Point::<2>::new(1.4, 1.3),
        ];
        let fe = FeSystem::<2>::new(2);
        let quad = QGauss::<2>::new(3);
        let table = fe.tabulate(&quad);
        let values = FeValues::reinit(&table, &quad, &vertices).unwrap();

        let f = |p: &Point<2>| p[0] * p[0] + 3.0 * p[0] * p[1];
        let coeffs: Vec<f64> = (0..9)
            .map(|n| f(&mapping::map_to_real(&vertices, &fe.node_reference_point(n))))
            .collect();
        for q in 0..values.n_quadrature_points() {
            let hess = (0..9).fold(Tensor2::<2>::zeros(), |acc, n| {
                acc + values.shape[q][n].hessian * coeffs[n]
            });
            assert_relative_eq!(hess[(0, 0)], 2.0, epsilon = 1e-10);
            assert_relative_eq!(hess[(0, 1)], 3.0, epsilon = 1e-10);
            assert_relative_eq!(hess[(1, 1)], 0.0, epsilon = 1e-10);
        }
        let area: f64 = values.jxw.iter().sum();
        assert_relative_eq!(area, 1.0 * 1.0 - 0.3 * 0.4, epsilon = 1e-12);
    }

    #[test]
    fn entity_and_face_queries() {
        let fe = FeSystem::<2>::new(2);
        // node 1 is the midpoint of the bottom edge
        assert_eq!(fe.support_entity(1), vec![0, 1]);
        assert_eq!(fe.support_entity(4), vec![0, 1, 2, 3]);
        assert_eq!(fe.face_nodes(3), vec![6, 7, 8]);
        assert_eq!(fe.closest_vertex(8), 3);
        assert_eq!(fe.system_to_component(7), (1, 2));
    }
}
