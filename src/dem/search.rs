//! Contact detection on the background mesh.
//!
//! The broad search pairs particles that sit in neighboring cells and pairs
//! particles with the boundary faces of their cell. The fine search keeps the
//! pairs that actually overlap and carries their tangential overlap over from
//! the previous step.

use crate::dem::particles::Particle;
use crate::discretization::mapping::{is_inside_unit_cell, transform_real_to_unit_cell};
use crate::discretization::mesh::{Mesh, Point};
use rayon::prelude::*;
use std::collections::BTreeMap;

/// A boundary face seen as a plane: a point on it and its outward normal.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundaryFace<const DIM: usize> {
    pub cell: usize,
    pub face: usize,
    pub boundary_id: u32,
    pub point: Point<DIM>,
    pub normal: Point<DIM>,
}

pub fn find_boundary_faces<const DIM: usize>(mesh: &Mesh<DIM>) -> Vec<BoundaryFace<DIM>> {
    let mut faces = Vec::new();
    for cell in &mesh.cells {
        for (face, id) in cell.face_boundary_ids.iter().enumerate() {
            let Some(boundary_id) = *id else { continue };
            let vertices = mesh.face_vertex_ids(cell.id, face);
            let point = vertices.iter().map(|&v| mesh.vertices[v]).sum::<Point<DIM>>() / vertices.len() as f64;
            faces.push(BoundaryFace {
                cell: cell.id,
                face,
                boundary_id,
                point,
                normal: mesh.face_normal(cell.id, face),
            });
        }
    }
    faces
}

/// For every cell: the cell itself, then the vertex-sharing cells with a
/// larger index. Each unordered pair of neighboring cells appears once.
pub fn find_cell_neighbors<const DIM: usize>(mesh: &Mesh<DIM>) -> Vec<Vec<usize>> {
    let vertex_map = mesh.vertex_to_cells();
    mesh.cells
        .iter()
        .map(|cell| {
            let mut list = vec![cell.id];
            let mut others: Vec<usize> = cell
                .vertex_ids
                .iter()
                .flat_map(|&v| vertex_map.cells_of(v).iter().copied())
                .filter(|&c| c > cell.id)
                .collect();
            others.sort_unstable();
            others.dedup();
            list.extend(others);
            list
        })
        .collect()
}

/// Axis-aligned bounding box of every cell, used to skip the inverse mapping.
pub fn cell_bounding_boxes<const DIM: usize>(mesh: &Mesh<DIM>) -> Vec<(Point<DIM>, Point<DIM>)> {
    mesh.cells
        .iter()
        .map(|cell| {
            let vertices = mesh.cell_vertices(cell.id);
            let lo = vertices.iter().fold(Point::<DIM>::repeat(f64::MAX), |a, v| a.inf(v));
            let hi = vertices.iter().fold(Point::<DIM>::repeat(f64::MIN), |a, v| a.sup(v));
            (lo, hi)
        })
        .collect()
}

/// Cell containing the center of every particle; `None` once a particle left
/// the mesh.
pub fn locate_particles<const DIM: usize>(
    mesh: &Mesh<DIM>,
    boxes: &[(Point<DIM>, Point<DIM>)],
    particles: &[Particle<DIM>],
) -> Vec<Option<usize>> {
    particles
        .par_iter()
        .map(|particle| {
            let x = &particle.position;
            boxes
                .iter()
                .enumerate()
                .filter(|(_, (lo, hi))| (0..DIM).all(|a| x[a] >= lo[a] - 1e-12 && x[a] <= hi[a] + 1e-12))
                .find_map(|(cell, _)| {
                    let xi = transform_real_to_unit_cell(&mesh.cell_vertices(cell), x).ok()?;
                    is_inside_unit_cell(&xi, 1e-12).then_some(cell)
                })
        })
        .collect()
}

/// Particle indices per cell.
pub fn particles_per_cell(n_cells: usize, locations: &[usize]) -> Vec<Vec<usize>> {
    let mut cells = vec![Vec::new(); n_cells];
    for (particle, &cell) in locations.iter().enumerate() {
        cells[cell].push(particle);
    }
    cells
}

/// Candidate particle pairs `(i, j)` from the cell neighbor lists.
pub fn pp_broad_search(cell_particles: &[Vec<usize>], neighbors: &[Vec<usize>]) -> Vec<(usize, usize)> {
    let mut pairs = Vec::new();
    for (cell, list) in neighbors.iter().enumerate() {
        let own = &cell_particles[cell];
        for (k, &i) in own.iter().enumerate() {
            for &j in &own[k + 1..] {
                pairs.push((i, j));
            }
        }
        for &other in list.iter().filter(|&&c| c != cell) {
            for &i in own {
                for &j in &cell_particles[other] {
                    pairs.push((i, j));
                }
            }
        }
    }
    pairs
}

/// Candidate `(particle, face)` pairs: particles against the boundary faces
/// of the cell they sit in.
pub fn pw_broad_search<const DIM: usize>(
    cell_particles: &[Vec<usize>],
    faces: &[BoundaryFace<DIM>],
) -> Vec<(usize, usize)> {
    faces
        .iter()
        .enumerate()
        .flat_map(|(f, face)| cell_particles[face.cell].iter().map(move |&p| (p, f)))
        .collect()
}

/// An overlapping particle pair. `normal` points from `i` to `j`.
#[derive(Debug, Clone, PartialEq)]
pub struct PpContact<const DIM: usize> {
    pub i: usize,
    pub j: usize,
    pub normal: Point<DIM>,
    pub overlap: f64,
    pub tangential_overlap: Point<DIM>,
}

impl<const DIM: usize> PpContact<DIM> {
    pub fn key(&self, particles: &[Particle<DIM>]) -> (u64, u64) {
        pair_key(particles[self.i].id, particles[self.j].id)
    }
}

/// A particle overlapping a wall. `normal` is the outward wall normal.
#[derive(Debug, Clone, PartialEq)]
pub struct PwContact<const DIM: usize> {
    pub particle: usize,
    pub face: usize,
    pub normal: Point<DIM>,
    pub overlap: f64,
    pub tangential_overlap: Point<DIM>,
}

fn pair_key(a: u64, b: u64) -> (u64, u64) {
    if a < b { (a, b) } else { (b, a) }
}

/// Tangential overlaps of the contacts alive after the last step.
pub type TangentialHistory<K, const DIM: usize> = BTreeMap<K, Point<DIM>>;

pub fn pp_fine_search<const DIM: usize>(
    particles: &[Particle<DIM>],
    candidates: &[(usize, usize)],
    history: &TangentialHistory<(u64, u64), DIM>,
) -> Vec<PpContact<DIM>> {
    candidates
        .iter()
        .filter_map(|&(i, j)| {
            let (a, b) = (&particles[i], &particles[j]);
            let offset = b.position - a.position;
            let distance = offset.norm();
            let overlap = a.radius() + b.radius() - distance;
            if overlap <= 0.0 || distance <= 0.0 {
                return None;
            }
            let tangential_overlap = history
                .get(&pair_key(a.id, b.id))
                .copied()
                .unwrap_or_else(Point::zeros);
            Some(PpContact {
                i,
                j,
                normal: offset / distance,
                overlap,
                tangential_overlap,
            })
        })
        .collect()
}

pub fn pw_fine_search<const DIM: usize>(
    particles: &[Particle<DIM>],
    faces: &[BoundaryFace<DIM>],
    candidates: &[(usize, usize)],
    history: &TangentialHistory<(u64, usize), DIM>,
) -> Vec<PwContact<DIM>> {
    candidates
        .iter()
        .filter_map(|&(p, f)| {
            let particle = &particles[p];
            let face = &faces[f];
            // distance of the center from the wall, positive inside the domain
            let distance = (face.point - particle.position).dot(&face.normal);
            let overlap = particle.radius() - distance;
            if overlap <= 0.0 {
                return None;
            }
            let tangential_overlap = history
                .get(&(particle.id, f))
                .copied()
                .unwrap_or_else(Point::zeros);
            Some(PwContact {
                particle: p,
                face: f,
                normal: face.normal,
                overlap,
                tangential_overlap,
            })
        })
        .collect()
}
