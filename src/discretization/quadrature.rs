use crate::discretization::mesh::Point;

/// Gauss-Legendre points and weights on `[-1, 1]`.
fn gauss_legendre_1d(n: usize) -> (Vec<f64>, Vec<f64>) {
    match n {
        0 | 1 => (vec![0.0], vec![2.0]),
        2 => {
            let a = 1.0 / 3f64.sqrt();
            (vec![-a, a], vec![1.0, 1.0])
        }
        3 => {
            let a = (3.0f64 / 5.0).sqrt();
            (vec![-a, 0.0, a], vec![5.0 / 9.0, 8.0 / 9.0, 5.0 / 9.0])
        }
        4 => (
            vec![
                -0.861_136_311_594_052_6,
                -0.339_981_043_584_856_3,
                0.339_981_043_584_856_3,
                0.861_136_311_594_052_6,
            ],
            vec![
                0.347_854_845_137_453_8,
                0.652_145_154_862_546_1,
                0.652_145_154_862_546_1,
                0.347_854_845_137_453_8,
            ],
        ),
        _ => (
            vec![
                -0.906_179_845_938_664,
                -0.538_469_310_105_683_1,
                0.0,
                0.538_469_310_105_683_1,
                0.906_179_845_938_664,
            ],
            vec![
                0.236_926_885_056_189_1,
                0.478_628_670_499_366_5,
                0.568_888_888_888_888_9,
                0.478_628_670_499_366_5,
                0.236_926_885_056_189_1,
            ],
        ),
    }
}

/// Tensor-product Gauss rule on the unit cell `[0,1]^DIM`.
#[derive(Debug, Clone)]
pub struct QGauss<const DIM: usize> {
    pub points: Vec<Point<DIM>>,
    pub weights: Vec<f64>,
}

impl<const DIM: usize> QGauss<DIM> {
    /// `n` points per direction, capped at 5.
    pub fn new(n: usize) -> Self {
        let (x, w) = gauss_legendre_1d(n);
        let n1 = x.len();
        let total = n1.pow(DIM as u32);
        let mut points = Vec::with_capacity(total);
        let mut weights = Vec::with_capacity(total);
        for idx in 0..total {
            let mut p = Point::<DIM>::zeros();
            let mut weight = 1.0;
            let mut rem = idx;
            for a in 0..DIM {
                let i = rem % n1;
                rem /= n1;
                p[a] = 0.5 * (x[i] + 1.0);
                weight *= 0.5 * w[i];
            }
            points.push(p);
            weights.push(weight);
        }
        Self { points, weights }
    }

    pub fn size(&self) -> usize {
        self.points.len()
    }
}
