use crate::discretization::mesh::Point;
use crate::physics::navier_stokes::StepReport;
use crate::physics::postprocessing::PointSample;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

/// Write column data to a CSV file with headers
pub fn write_csv<P: AsRef<Path>>(path: P, headers: &[&str], data: &[Vec<f64>]) -> io::Result<()> {
    if !headers.is_empty() && !data.is_empty() && headers.len() != data.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "Headers count ({}) doesn't match data columns ({})",
                headers.len(),
                data.len()
            ),
        ));
    }

    let mut file = File::create(path)?;

    writeln!(file, "{}", headers.join(","))?;

    let n_rows = data.iter().map(|col| col.len()).max().unwrap_or(0);

    for i in 0..n_rows {
        let row: Vec<String> = data
            .iter()
            .map(|col| col.get(i).map(|v| format!("{:.15e}", v)).unwrap_or_default())
            .collect();
        writeln!(file, "{}", row.join(","))?;
    }

    Ok(())
}

/// Write x-y data pairs
pub fn write_xy<P: AsRef<Path>>(
    path: P,
    x_header: &str,
    y_header: &str,
    x_data: &[f64],
    y_data: &[f64],
) -> io::Result<()> {
    if x_data.len() != y_data.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "X and Y data lengths don't match ({} vs {})",
                x_data.len(),
                y_data.len()
            ),
        ));
    }
    write_csv(
        path,
        &[x_header, y_header],
        &[x_data.to_vec(), y_data.to_vec()],
    )
}

/// One row per accepted step.
pub fn write_step_reports<P: AsRef<Path>>(path: P, reports: &[StepReport]) -> io::Result<()> {
    let column = |f: &dyn Fn(&StepReport) -> f64| reports.iter().map(f).collect::<Vec<f64>>();
    write_csv(
        path,
        &["iteration", "time", "dt", "newton", "linear", "residual", "cfl"],
        &[
            column(&|r| r.iteration as f64),
            column(&|r| r.time),
            column(&|r| r.dt),
            column(&|r| r.newton_iterations as f64),
            column(&|r| r.linear_iterations as f64),
            column(&|r| r.final_residual),
            column(&|r| r.cfl),
        ],
    )
}

/// Coordinates, velocity and pressure along a set of sample points. Points
/// outside the mesh are skipped.
pub fn write_profile<P: AsRef<Path>, const DIM: usize>(
    path: P,
    samples: &[(Point<DIM>, Option<PointSample<DIM>>)],
) -> io::Result<()> {
    let axes = ["x", "y", "z"];
    let velocity = ["u", "v", "w"];
    let mut headers: Vec<&str> = axes[..DIM].to_vec();
    headers.extend(&velocity[..DIM]);
    headers.push("p");

    let mut columns = vec![Vec::new(); 2 * DIM + 1];
    for (point, sample) in samples {
        let Some(sample) = sample else { continue };
        for a in 0..DIM {
            columns[a].push(point[a]);
            columns[DIM + a].push(sample.velocity[a]);
        }
        columns[2 * DIM].push(sample.pressure);
    }
    write_csv(path, &headers, &columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_write_csv() {
        let path = std::env::temp_dir().join("glsns_write_csv.csv");
        let headers = &["x", "y", "z"];
        let data = vec![
            vec![1.0, 2.0, 3.0],
            vec![4.0, 5.0, 6.0],
            vec![7.0, 8.0],
        ];

        write_csv(&path, headers, &data).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "x,y,z");
        assert_eq!(lines.len(), 4);
        assert!(lines[3].ends_with(','));

        assert!(write_csv(&path, &["x"], &data).is_err());
        fs::remove_file(&path).ok();
    }

    #[test]
    fn profiles_skip_points_outside_the_mesh() {
        let path = std::env::temp_dir().join("glsns_profile.csv");
        let samples = vec![
            (
                Point::<2>::new(0.5, 0.25),
                Some(PointSample {
                    cell: 0,
                    velocity: Point::<2>::new(1.0, -1.0),
                    pressure: 0.5,
                }),
            ),
            (Point::<2>::new(2.0, 0.25), None),
        ];
        write_profile(&path, &samples).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "x,y,u,v,p");
        assert_eq!(lines.len(), 2);
        fs::remove_file(&path).ok();
    }
}
