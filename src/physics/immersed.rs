//! Sharp-interface immersed boundary on a circle (2D) or sphere (3D).
//!
//! After the regular assembly, every velocity dof of a cell cut by the
//! interface whose support point lies in the solid gets its row replaced by
//! a three point stencil. With `S` the support point, `B` its radial
//! projection on the interface and `P = S + (S - B)` the image point, `S` is
//! the midpoint of `B` and `P`, so the row enforces `-2 u_S + u_P + u_B = 0`. `u_P` is interpolated from the
//! cell containing `P`, searched among the cells around the vertex closest to
//! `S`.

use crate::config::ImmersedBoundaryParameters;
use crate::discretization::dof_handler::DofHandler;
use crate::discretization::fe::FeSystem;
use crate::discretization::mapping::{
    distance_to_unit_cell, is_inside_unit_cell, project_to_unit_cell, transform_real_to_unit_cell,
};
use crate::discretization::mesh::{Mesh, Point};
use crate::error::ConfigurationError;
use crate::numerics::sparse::{SparseError, SparseMatrix, SparsityPattern};
use crate::physics::constraints::AffineConstraints;
use nalgebra::DVector;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Reference points this close to the unit cell count as inside.
const INSIDE_TOLERANCE: f64 = 1e-10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Surface {
    Inner,
    Outer,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImmersedGeometry<const DIM: usize> {
    pub center: Point<DIM>,
    pub inner_radius: f64,
    /// Present only in the two-boundary (Couette) configuration.
    pub outer_radius: Option<f64>,
    pub tangential_speed: f64,
}

impl<const DIM: usize> ImmersedGeometry<DIM> {
    pub fn from_parameters(params: &ImmersedBoundaryParameters) -> Result<Self, ConfigurationError> {
        if params.center.len() != DIM {
            return Err(ConfigurationError::ImmersedBoundary(format!(
                "center has {} coordinates in a {DIM}D run",
                params.center.len()
            )));
        }
        if params.inner_radius <= 0.0 || (params.couette && params.outer_radius <= params.inner_radius) {
            return Err(ConfigurationError::ImmersedBoundary(format!(
                "radii {} / {} are not ordered",
                params.inner_radius, params.outer_radius
            )));
        }
        Ok(Self {
            center: Point::<DIM>::from_column_slice(&params.center),
            inner_radius: params.inner_radius,
            outer_radius: params.couette.then_some(params.outer_radius),
            tangential_speed: params.tangential_speed,
        })
    }

    pub fn is_couette(&self) -> bool {
        self.outer_radius.is_some()
    }

    pub fn radius(&self, surface: Surface) -> f64 {
        match surface {
            Surface::Inner => self.inner_radius,
            Surface::Outer => self.outer_radius.unwrap_or(self.inner_radius),
        }
    }

    /// Surfaces crossing a cell whose nodes sit at `points`: some but not all
    /// nodes lie within the radius.
    pub fn cutting_surfaces<'a>(&self, points: impl Iterator<Item = &'a Point<DIM>> + Clone) -> Vec<Surface> {
        let mut surfaces = vec![Surface::Inner];
        if self.is_couette() {
            surfaces.push(Surface::Outer);
        }
        let total = points.clone().count();
        surfaces.retain(|&s| {
            let r = self.radius(s);
            let inside = points.clone().filter(|p| (*p - self.center).norm() <= r).count();
            inside != 0 && inside != total
        });
        surfaces
    }

    /// Whether `p` lies in the solid bounded by `surface`: inside the inner
    /// circle, or beyond the outer one.
    pub fn in_solid(&self, surface: Surface, p: &Point<DIM>) -> bool {
        let distance = (p - self.center).norm();
        match surface {
            Surface::Inner => distance <= self.radius(surface),
            Surface::Outer => distance >= self.radius(surface),
        }
    }

    /// Unit radial direction through `p`; the first axis at the center.
    pub fn radial_direction(&self, p: &Point<DIM>) -> Point<DIM> {
        let offset = p - self.center;
        let norm = offset.norm();
        if norm > 0.0 {
            offset / norm
        } else {
            let mut e = Point::<DIM>::zeros();
            e[0] = 1.0;
            e
        }
    }

    /// Velocity imposed on `surface` at the point with outward normal `n`.
    /// Only the inner surface of a Couette configuration moves; it rotates
    /// about the z axis.
    pub fn boundary_velocity(&self, surface: Surface, n: &Point<DIM>) -> Point<DIM> {
        let mut u = Point::<DIM>::zeros();
        if surface == Surface::Inner && self.is_couette() && DIM >= 2 {
            u[0] = -self.tangential_speed * n[1];
            u[1] = self.tangential_speed * n[0];
        }
        u
    }
}

/// One rewritten row: `scale * (sum c_j u_j - target) = 0`.
#[derive(Debug, Clone, PartialEq)]
pub struct StencilRow {
    pub dof: usize,
    pub surface: Surface,
    /// Assembled diagonal the row replaced in the latest rewrite.
    pub scale: f64,
    pub coefficients: Vec<(usize, f64)>,
    pub target: f64,
}

impl StencilRow {
    pub fn defect(&self, u: &DVector<f64>) -> f64 {
        self.coefficients.iter().map(|&(j, c)| c * u[j]).sum::<f64>() - self.target
    }
}

/// An image point that no cell of the searched patch contains. The stencil
/// then interpolates from the nearest patch cell at the clamped reference
/// point.
#[derive(Debug, Clone, PartialEq)]
pub struct GeometricLookupMiss<const DIM: usize> {
    pub dof: usize,
    pub image: Point<DIM>,
    pub fallback_cell: usize,
    /// Distance of the image point from the fallback cell, in reference coordinates.
    pub distance: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImmersedBoundaryReport<const DIM: usize> {
    pub cut_cells: usize,
    pub rows: usize,
    pub zero_offset_rows: usize,
    pub misses: Vec<GeometricLookupMiss<DIM>>,
}

#[derive(Debug, Clone)]
pub struct ImmersedBoundary<const DIM: usize> {
    geometry: ImmersedGeometry<DIM>,
    rows: Vec<StencilRow>,
    cut_cells: Vec<usize>,
    report: ImmersedBoundaryReport<DIM>,
}

enum Lookup<const DIM: usize> {
    Found(usize, Point<DIM>),
    Nearest(usize, Point<DIM>, f64),
    Failed,
}

/// Finds the patch cell containing `p`, or the patch cell closest to it.
fn locate<const DIM: usize>(mesh: &Mesh<DIM>, patch: &[usize], p: &Point<DIM>) -> Lookup<DIM> {
    let mut nearest: Option<(usize, Point<DIM>, f64)> = None;
    for &cell in patch {
        let Ok(xi) = transform_real_to_unit_cell(&mesh.cell_vertices(cell), p) else {
            continue;
        };
        if is_inside_unit_cell(&xi, INSIDE_TOLERANCE) {
            return Lookup::Found(cell, project_to_unit_cell(&xi));
        }
        let d = distance_to_unit_cell(&xi);
        if nearest.as_ref().is_none_or(|(_, _, best)| d < *best) {
            nearest = Some((cell, xi, d));
        }
    }
    match nearest {
        Some((cell, xi, d)) => Lookup::Nearest(cell, project_to_unit_cell(&xi), d),
        None => Lookup::Failed,
    }
}

impl<const DIM: usize> ImmersedBoundary<DIM> {
    /// Classifies the locally owned cells and builds the stencil of every
    /// velocity dof of a cut cell whose node lies in the solid of the cutting
    /// surface. Each dof is rewritten once, for the first surface that cuts
    /// one of its cells; fluid-side dofs keep their assembled rows and
    /// constrained dofs keep their constraint.
    pub fn setup(
        geometry: ImmersedGeometry<DIM>,
        mesh: &Mesh<DIM>,
        fe: &FeSystem<DIM>,
        dofs: &DofHandler<DIM>,
        constraints: &AffineConstraints,
        rank: usize,
    ) -> Self {
        let vertex_map = mesh.vertex_to_cells();
        let owned = dofs.locally_owned_dofs(rank);
        let mut handled = vec![false; dofs.n_dofs()];
        let mut report = ImmersedBoundaryReport::default();
        let mut rows = Vec::new();
        let mut cut_cells = Vec::new();

        for cell in mesh.locally_owned_cells(rank) {
            let nodes = dofs.cell_nodes(cell.id);
            let surfaces = geometry.cutting_surfaces(nodes.iter().map(|&n| dofs.node_point(n)));
            if surfaces.is_empty() {
                continue;
            }
            cut_cells.push(cell.id);

            for surface in surfaces {
                for (local, &node) in nodes.iter().enumerate() {
                    if !geometry.in_solid(surface, dofs.node_point(node)) {
                        continue;
                    }
                    let vertex = cell.vertex_ids[fe.closest_vertex(local)];
                    for comp in 0..DIM {
                        let dof = dofs.dof(node, comp);
                        if handled[dof] || !owned.contains(&dof) || constraints.is_constrained(dof) {
                            continue;
                        }
                        handled[dof] = true;
                        let row = Self::stencil_row(
                            &geometry,
                            mesh,
                            fe,
                            dofs,
                            vertex_map.cells_of(vertex),
                            (dof, comp, surface),
                            &mut report,
                        );
                        rows.push(row);
                    }
                }
            }
        }

        report.cut_cells = cut_cells.len();
        report.rows = rows.len();
        debug!(
            cut_cells = report.cut_cells,
            rows = report.rows,
            misses = report.misses.len(),
            "immersed boundary stencils built"
        );
        Self {
            geometry,
            rows,
            cut_cells,
            report,
        }
    }

    fn stencil_row(
        geometry: &ImmersedGeometry<DIM>,
        mesh: &Mesh<DIM>,
        fe: &FeSystem<DIM>,
        dofs: &DofHandler<DIM>,
        patch: &[usize],
        (dof, comp, surface): (usize, usize, Surface),
        report: &mut ImmersedBoundaryReport<DIM>,
    ) -> StencilRow {
        let s = *dofs.support_point(dof);
        let radius = geometry.radius(surface);
        let normal = geometry.radial_direction(&s);
        let b = geometry.center + normal * radius;
        let u_b = geometry.boundary_velocity(surface, &normal)[comp];
        let offset = s - b;

        // a support point on the interface takes the boundary value directly
        if offset.norm() <= 1e-12 * radius {
            report.zero_offset_rows += 1;
            return StencilRow {
                dof,
                surface,
                scale: 1.0,
                coefficients: vec![(dof, 1.0)],
                target: u_b,
            };
        }

        let image = s + offset;
        let mut coefficients: BTreeMap<usize, f64> = BTreeMap::from([(dof, -2.0)]);
        let (cell, xi) = match locate(mesh, patch, &image) {
            Lookup::Found(cell, xi) => (cell, xi),
            Lookup::Nearest(cell, xi, distance) => {
                warn!(dof, ?image, cell, distance, "immersed boundary image point outside its vertex patch");
                report.misses.push(GeometricLookupMiss {
                    dof,
                    image,
                    fallback_cell: cell,
                    distance,
                });
                (cell, xi)
            }
            Lookup::Failed => {
                // no usable cell: u_P = u_S, the row degenerates to u_S = u_B
                warn!(dof, ?image, "immersed boundary image point could not be mapped");
                report.misses.push(GeometricLookupMiss {
                    dof,
                    image,
                    fallback_cell: usize::MAX,
                    distance: f64::INFINITY,
                });
                *coefficients.entry(dof).or_insert(0.0) += 1.0;
                return StencilRow {
                    dof,
                    surface,
                    scale: 1.0,
                    coefficients: coefficients.into_iter().collect(),
                    target: -u_b,
                };
            }
        };

        for (local, &node) in dofs.cell_nodes(cell).iter().enumerate() {
            let phi = fe.shape_value(local, &xi);
            if phi != 0.0 {
                *coefficients.entry(dofs.dof(node, comp)).or_insert(0.0) += phi;
            }
        }
        StencilRow {
            dof,
            surface,
            scale: 1.0,
            coefficients: coefficients.into_iter().collect(),
            target: -u_b,
        }
    }

    pub fn geometry(&self) -> &ImmersedGeometry<DIM> {
        &self.geometry
    }

    pub fn rows(&self) -> &[StencilRow] {
        &self.rows
    }

    pub fn cut_cells(&self) -> &[usize] {
        &self.cut_cells
    }

    pub fn report(&self) -> &ImmersedBoundaryReport<DIM> {
        &self.report
    }

    /// Stencil couplings reach cells that do not share the row's dof.
    pub fn add_sparsity_couplings(&self, pattern: &mut SparsityPattern) {
        for row in &self.rows {
            pattern.add_entries(row.dof, row.coefficients.iter().map(|&(j, _)| j));
        }
    }

    /// Flags the rewritten rows in a vector of `n` dofs.
    pub fn row_mask(&self, n: usize) -> Vec<bool> {
        let mut mask = vec![false; n];
        for row in &self.rows {
            mask[row.dof] = true;
        }
        mask
    }

    /// Rows are scaled by the diagonal they replace, which keeps them in the
    /// magnitude range of the rest of the matrix.
    fn scale_for(diagonal: f64) -> f64 {
        if diagonal.abs() > f64::MIN_POSITIVE { diagonal } else { 1.0 }
    }

    /// Replaces the stencil rows of an assembled Jacobian and rhs.
    pub fn apply_to_system(
        &mut self,
        matrix: &mut SparseMatrix,
        rhs: &mut DVector<f64>,
        evaluation: &DVector<f64>,
    ) -> Result<(), SparseError> {
        for row in &mut self.rows {
            row.scale = Self::scale_for(matrix.diagonal(row.dof));
            matrix.zero_row(row.dof);
            for &(col, c) in &row.coefficients {
                matrix.add(row.dof, col, row.scale * c)?;
            }
            rhs[row.dof] = -row.scale * row.defect(evaluation);
        }
        Ok(())
    }

    /// Residual-only counterpart of `apply_to_system`. `diagonal` holds the
    /// assembled diagonal of the rewritten rows, as the Jacobian would have it.
    pub fn apply_to_rhs(&mut self, rhs: &mut DVector<f64>, evaluation: &DVector<f64>, diagonal: &DVector<f64>) {
        for row in &mut self.rows {
            row.scale = Self::scale_for(diagonal[row.dof]);
            rhs[row.dof] = -row.scale * row.defect(evaluation);
        }
    }
}
