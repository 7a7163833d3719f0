use std::collections::BTreeMap;
use std::sync::Arc;

use crate::discretization::dof_handler::DofHandler;
use crate::discretization::fe::FeSystem;
use crate::discretization::mesh::{Mesh, Point};
use crate::error::ConfigurationError;
use crate::physics::constraints::{AffineConstraints, ConstraintError, ConstraintSets};

/// Shared scalar function of position and time.
pub type SFn<const DIM: usize> = Arc<dyn Fn(&Point<DIM>, f64) -> f64 + Send + Sync>;

/// Local trait allowing convenient conversion into [`SFn`].
pub trait IntoSFn<const DIM: usize> {
    fn into_sfn(self) -> SFn<DIM>;
}

fn c<const DIM: usize>(val: f64) -> SFn<DIM> {
    Arc::new(move |_, _| val)
}

impl<const DIM: usize> IntoSFn<DIM> for f64 {
    fn into_sfn(self) -> SFn<DIM> {
        c(self)
    }
}

impl<const DIM: usize, F> IntoSFn<DIM> for F
where
    F: Fn(&Point<DIM>, f64) -> f64 + Send + Sync + 'static,
{
    fn into_sfn(self) -> SFn<DIM> {
        Arc::new(self)
    }
}

/// Vector-valued field given per component, e.g. a prescribed velocity or a
/// body force.
#[derive(Clone)]
pub struct VectorFunction<const DIM: usize> {
    pub components: Vec<SFn<DIM>>,
}

impl<const DIM: usize> VectorFunction<DIM> {
    pub fn new(components: Vec<SFn<DIM>>) -> Self {
        Self { components }
    }

    pub fn zero() -> Self {
        Self {
            components: (0..DIM).map(|_| c(0.0)).collect(),
        }
    }

    pub fn constant(values: [f64; DIM]) -> Self {
        Self {
            components: values.iter().map(|&v| c(v)).collect(),
        }
    }

    /// Component `i`, zero when not provided.
    pub fn value(&self, i: usize, p: &Point<DIM>, t: f64) -> f64 {
        self.components.get(i).map_or(0.0, |f| f(p, t))
    }

    pub fn vector(&self, p: &Point<DIM>, t: f64) -> Point<DIM> {
        Point::<DIM>::from_fn(|i, _| self.value(i, p, t))
    }
}

#[derive(Clone)]
pub enum BoundaryCondition<const DIM: usize> {
    None,
    NoSlip,
    /// No flux through the wall, tangential velocity free.
    Slip,
    Function(VectorFunction<DIM>),
    /// Ties every node of this boundary to its image on `periodic_id`,
    /// translated along axis `direction`.
    Periodic { periodic_id: u32, direction: usize },
}

impl<const DIM: usize> BoundaryCondition<DIM> {
    pub fn tag(&self) -> &'static str {
        match self {
            BoundaryCondition::None => "none",
            BoundaryCondition::NoSlip => "noslip",
            BoundaryCondition::Slip => "slip",
            BoundaryCondition::Function(_) => "function",
            BoundaryCondition::Periodic { .. } => "periodic",
        }
    }
}

/// Pins the pressure dof nearest to `point`, removing the constant-pressure
/// null space of enclosed flows.
#[derive(Debug, Clone, Copy)]
pub struct PressureReference<const DIM: usize> {
    pub point: Point<DIM>,
    pub value: f64,
}

#[derive(Clone, Default)]
pub struct BoundaryConditions<const DIM: usize> {
    rules: BTreeMap<u32, BoundaryCondition<DIM>>,
    pub pressure_reference: Option<PressureReference<DIM>>,
}

impl<const DIM: usize> BoundaryConditions<DIM> {
    pub fn new() -> Self {
        Self {
            rules: BTreeMap::new(),
            pressure_reference: None,
        }
    }

    pub fn add(&mut self, boundary_id: u32, bc: BoundaryCondition<DIM>) -> &mut Self {
        self.rules.insert(boundary_id, bc);
        self
    }

    pub fn find_for(&self, boundary_id: u32) -> Option<&BoundaryCondition<DIM>> {
        self.rules.get(&boundary_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &BoundaryCondition<DIM>)> {
        self.rules.iter().map(|(&id, bc)| (id, bc))
    }

    /// Rejects references to boundaries the mesh does not carry.
    pub fn validate(&self, mesh: &Mesh<DIM>) -> Result<(), ConfigurationError> {
        let ids = mesh.boundary_ids();
        for (id, bc) in self.iter() {
            if !ids.contains(&id) {
                return Err(ConfigurationError::InvalidParameter {
                    name: "boundary_conditions",
                    reason: format!("{} condition on unknown boundary id {id}", bc.tag()),
                });
            }
            if let BoundaryCondition::Periodic { periodic_id, direction } = bc {
                if !ids.contains(periodic_id) || *direction >= DIM {
                    return Err(ConfigurationError::InvalidParameter {
                        name: "boundary_conditions",
                        reason: format!("periodic pair {id} -> {periodic_id} along axis {direction}"),
                    });
                }
            }
            if let BoundaryCondition::Function(f) = bc {
                if f.components.len() != DIM {
                    return Err(ConfigurationError::InvalidParameter {
                        name: "boundary_conditions",
                        reason: format!("function on boundary {id} has {} components", f.components.len()),
                    });
                }
            }
        }
        Ok(())
    }

    /// Builds the nonzero and zero constraint sets together. Both share one
    /// structure and differ only in their inhomogeneities.
    pub fn make_constraints(
        &self,
        mesh: &Mesh<DIM>,
        fe: &FeSystem<DIM>,
        dofs: &DofHandler<DIM>,
        time: f64,
    ) -> Result<ConstraintSets, ConstraintError> {
        let mut nonzero = AffineConstraints::new();

        for (id, bc) in self.iter() {
            let nodes = dofs.boundary_nodes(mesh, fe, id);
            match bc {
                BoundaryCondition::None => {}
                BoundaryCondition::NoSlip => {
                    for &node in &nodes {
                        for comp in 0..DIM {
                            nonzero.constrain_value(dofs.dof(node, comp), 0.0);
                        }
                    }
                }
                BoundaryCondition::Function(f) => {
                    for &node in &nodes {
                        let p = dofs.node_point(node);
                        for comp in 0..DIM {
                            nonzero.constrain_value(dofs.dof(node, comp), f.value(comp, p, time));
                        }
                    }
                }
                BoundaryCondition::Slip => {
                    let normals = boundary_node_normals(mesh, fe, dofs, id);
                    for (node, n) in normals {
                        let k = n.iamax();
                        let dominant = dofs.dof(node, k);
                        let entries = (0..DIM)
                            .filter(|&c| c != k && n[c] != 0.0)
                            .map(|c| (dofs.dof(node, c), -n[c] / n[k]))
                            .collect();
                        nonzero.constrain(dominant, entries, 0.0);
                    }
                }
                BoundaryCondition::Periodic { periodic_id, direction } => {
                    let images = dofs.boundary_nodes(mesh, fe, *periodic_id);
                    for (node, image) in match_periodic_nodes(dofs, &nodes, &images, *direction) {
                        for comp in 0..=DIM {
                            nonzero.constrain(dofs.dof(node, comp), vec![(dofs.dof(image, comp), 1.0)], 0.0);
                        }
                    }
                }
            }
        }

        if let Some(reference) = &self.pressure_reference {
            let node = (0..dofs.n_nodes())
                .filter(|&n| !nonzero.is_constrained(dofs.dof(n, DIM)))
                .min_by(|&a, &b| {
                    let da = (dofs.node_point(a) - reference.point).norm();
                    let db = (dofs.node_point(b) - reference.point).norm();
                    da.total_cmp(&db)
                });
            if let Some(node) = node {
                nonzero.constrain_value(dofs.dof(node, DIM), reference.value);
            }
        }

        nonzero.close()?;
        let zero = nonzero.homogeneous();
        Ok(ConstraintSets::new(nonzero, zero))
    }
}

/// Averaged outward normal at every node of boundary `id`.
fn boundary_node_normals<const DIM: usize>(
    mesh: &Mesh<DIM>,
    fe: &FeSystem<DIM>,
    dofs: &DofHandler<DIM>,
    id: u32,
) -> BTreeMap<usize, Point<DIM>> {
    let mut normals: BTreeMap<usize, Point<DIM>> = BTreeMap::new();
    for cell in &mesh.cells {
        for (face, bid) in cell.face_boundary_ids.iter().enumerate() {
            if *bid != Some(id) {
                continue;
            }
            let n = mesh.face_normal(cell.id, face);
            for local in fe.face_nodes(face) {
                let node = dofs.cell_nodes(cell.id)[local];
                *normals.entry(node).or_insert_with(Point::zeros) += n;
            }
        }
    }
    normals
        .into_iter()
        .filter_map(|(node, n)| (n.norm() > 0.0).then(|| (node, n.normalize())))
        .collect()
}

/// Pairs each node with the node on the opposite boundary that matches it in
/// every coordinate except `direction`.
fn match_periodic_nodes<const DIM: usize>(
    dofs: &DofHandler<DIM>,
    nodes: &std::collections::BTreeSet<usize>,
    images: &std::collections::BTreeSet<usize>,
    direction: usize,
) -> Vec<(usize, usize)> {
    let scale = images
        .iter()
        .map(|&n| dofs.node_point(n).amax())
        .fold(1.0_f64, f64::max);
    let tolerance = 1e-10 * scale;
    nodes
        .iter()
        .filter_map(|&node| {
            let p = dofs.node_point(node);
            images
                .iter()
                .find(|&&m| {
                    let q = dofs.node_point(m);
                    m != node && (0..DIM).filter(|&a| a != direction).all(|a| (p[a] - q[a]).abs() <= tolerance)
                })
                .map(|&m| (node, m))
        })
        .collect()
}
