use crate::discretization::mesh::{Cell, Mesh, Point};

/// Structured grid of `repetitions[a]` cells per axis spanning the box `[p1, p2]`.
/// With `colorize`, the face on side `s` of axis `a` gets boundary id `2a + s`,
/// otherwise every boundary face gets id 0.
pub fn subdivided_hyper_rectangle<const DIM: usize>(
    repetitions: [usize; DIM],
    p1: Point<DIM>,
    p2: Point<DIM>,
    colorize: bool,
) -> Mesh<DIM> {
    let n_vert: Vec<usize> = repetitions.iter().map(|r| r + 1).collect();
    let mut strides = vec![1usize; DIM];
    for a in 1..DIM {
        strides[a] = strides[a - 1] * n_vert[a - 1];
    }
    let total_vertices: usize = n_vert.iter().product();

    let mut vertices = Vec::with_capacity(total_vertices);
    for idx in 0..total_vertices {
        let mut p = Point::<DIM>::zeros();
        for a in 0..DIM {
            let i = (idx / strides[a]) % n_vert[a];
            p[a] = p1[a] + (p2[a] - p1[a]) * i as f64 / repetitions[a] as f64;
        }
        vertices.push(p);
    }

    let total_cells: usize = repetitions.iter().product();
    let mut cells = Vec::with_capacity(total_cells);
    for id in 0..total_cells {
        let mut multi = [0usize; DIM];
        let mut rem = id;
        for a in 0..DIM {
            multi[a] = rem % repetitions[a];
            rem /= repetitions[a];
        }

        let vertex_ids = (0..1usize << DIM)
            .map(|v| {
                (0..DIM)
                    .map(|a| (multi[a] + ((v >> a) & 1)) * strides[a])
                    .sum()
            })
            .collect();

        let face_boundary_ids = (0..2 * DIM)
            .map(|f| {
                let (axis, side) = (f / 2, f % 2);
                let on_boundary = if side == 0 {
                    multi[axis] == 0
                } else {
                    multi[axis] + 1 == repetitions[axis]
                };
                on_boundary.then_some(if colorize { f as u32 } else { 0 })
            })
            .collect();

        cells.push(Cell {
            id,
            vertex_ids,
            face_boundary_ids,
            subdomain: 0,
        });
    }

    Mesh { vertices, cells }
}

/// `n` cells per axis on `[left, right]^DIM`.
pub fn hyper_cube<const DIM: usize>(n: usize, left: f64, right: f64, colorize: bool) -> Mesh<DIM> {
    subdivided_hyper_rectangle(
        [n; DIM],
        Point::<DIM>::repeat(left),
        Point::<DIM>::repeat(right),
        colorize,
    )
}

/// Splits the cells into `n_parts` contiguous blocks of near-equal size.
pub fn partition_cells<const DIM: usize>(mesh: &mut Mesh<DIM>, n_parts: usize) {
    let n_parts = n_parts.max(1);
    let n = mesh.cells.len();
    for cell in mesh.cells.iter_mut() {
        cell.subdomain = (cell.id * n_parts / n.max(1)).min(n_parts - 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colorized_ids_follow_axis_and_side() {
        let mesh = hyper_cube::<2>(3, 0.0, 1.0, true);
        // bottom-left cell touches the x=0 and y=0 sides
        assert_eq!(mesh.cells[0].face_boundary_ids, vec![Some(0), None, Some(2), None]);
        // top-right cell touches x=1 and y=1
        assert_eq!(mesh.cells[8].face_boundary_ids, vec![None, Some(1), None, Some(3)]);
        assert!(!mesh.cells[4].at_boundary());
    }

    #[test]
    fn partition_is_contiguous_and_balanced() {
        let mut mesh = hyper_cube::<2>(4, 0.0, 1.0, false);
        partition_cells(&mut mesh, 3);
        let counts: Vec<usize> = (0..3)
            .map(|r| mesh.locally_owned_cells(r).count())
            .collect();
        assert_eq!(counts.iter().sum::<usize>(), 16);
        assert!(counts.iter().all(|&c| (5..=6).contains(&c)));
        assert_eq!(mesh.n_subdomains(), 3);
    }
}
