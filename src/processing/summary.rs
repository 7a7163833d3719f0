use crate::physics::navier_stokes::{NavierStokesSolver, StepReport};
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

pub struct SimulationSummary {
    // Mesh info
    pub dim: usize,
    pub num_cells: usize,
    pub num_vertices: usize,
    pub num_dofs: usize,
    pub domain_min: Vec<f64>,
    pub domain_max: Vec<f64>,
    pub min_cell_measure: f64,
    pub max_cell_measure: f64,

    // Discretization
    pub velocity_order: usize,
    pub viscosity: f64,
    pub method: String,

    // Immersed boundary
    pub cut_cells: usize,
    pub stencil_rows: usize,
    pub lookup_misses: usize,

    // Solver info
    pub steps: usize,
    pub newton_iterations: usize,
    pub linear_iterations: usize,
    pub jacobian_assemblies: usize,
    pub step_retries: usize,
    pub final_residual: Option<f64>,
    pub final_time: Option<f64>,
    pub max_cfl: Option<f64>,

    // Flow statistics
    pub kinetic_energy: Option<f64>,
    pub enstrophy: Option<f64>,
}

impl SimulationSummary {
    pub fn from_solver<const DIM: usize>(solver: &NavierStokesSolver<DIM>) -> Self {
        let mesh = solver.mesh();
        let params = solver.parameters();

        let mut domain_min = vec![f64::INFINITY; DIM];
        let mut domain_max = vec![f64::NEG_INFINITY; DIM];
        for v in &mesh.vertices {
            for a in 0..DIM {
                domain_min[a] = domain_min[a].min(v[a]);
                domain_max[a] = domain_max[a].max(v[a]);
            }
        }
        let measures: Vec<f64> = (0..mesh.n_cells()).map(|c| mesh.measure(c)).collect();

        let (cut_cells, stencil_rows, lookup_misses) = solver
            .immersed_boundary()
            .map(|ib| (ib.report().cut_cells, ib.report().rows, ib.report().misses.len()))
            .unwrap_or((0, 0, 0));

        Self {
            dim: DIM,
            num_cells: mesh.n_cells(),
            num_vertices: mesh.n_vertices(),
            num_dofs: solver.dofs().n_dofs(),
            domain_min,
            domain_max,
            min_cell_measure: measures.iter().cloned().fold(f64::INFINITY, f64::min),
            max_cell_measure: measures.iter().cloned().fold(0.0, f64::max),
            velocity_order: params.fem.velocity_order,
            viscosity: params.physical_properties.viscosity,
            method: format!("{:?}", params.simulation_control.method),
            cut_cells,
            stencil_rows,
            lookup_misses,
            steps: 0,
            newton_iterations: 0,
            linear_iterations: 0,
            jacobian_assemblies: 0,
            step_retries: 0,
            final_residual: None,
            final_time: None,
            max_cfl: None,
            kinetic_energy: None,
            enstrophy: None,
        }
    }

    pub fn add_step_reports(&mut self, reports: &[StepReport]) {
        self.steps += reports.len();
        for r in reports {
            self.newton_iterations += r.newton_iterations;
            self.linear_iterations += r.linear_iterations;
            self.jacobian_assemblies += r.jacobian_assemblies;
            self.step_retries += r.retries;
            self.max_cfl = Some(self.max_cfl.map_or(r.cfl, |c| c.max(r.cfl)));
        }
        if let Some(last) = reports.last() {
            self.final_residual = Some(last.final_residual);
            self.final_time = Some(last.time);
        }
    }

    pub fn add_statistics(&mut self, kinetic_energy: f64, enstrophy: f64) {
        self.kinetic_energy = Some(kinetic_energy);
        self.enstrophy = Some(enstrophy);
    }

    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        self.write(&mut file)
    }

    fn write<W: Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(out, "{}", "=".repeat(60))?;
        writeln!(out, "NAVIER-STOKES SIMULATION SUMMARY")?;
        writeln!(out, "{}", "=".repeat(60))?;
        writeln!(out)?;

        writeln!(out, "MESH STATISTICS")?;
        writeln!(out, "{}", "-".repeat(60))?;
        writeln!(out, "Dimension:           {}", self.dim)?;
        writeln!(out, "Number of cells:     {}", self.num_cells)?;
        writeln!(out, "Number of vertices:  {}", self.num_vertices)?;
        writeln!(out, "Number of dofs:      {}", self.num_dofs)?;
        writeln!(out, "Domain min:          {:?}", self.domain_min)?;
        writeln!(out, "Domain max:          {:?}", self.domain_max)?;
        writeln!(out, "Min cell measure:    {:.6e}", self.min_cell_measure)?;
        writeln!(out, "Max cell measure:    {:.6e}", self.max_cell_measure)?;
        writeln!(out)?;

        writeln!(out, "DISCRETIZATION")?;
        writeln!(out, "{}", "-".repeat(60))?;
        writeln!(out, "Element:             Q{}-Q{}", self.velocity_order, self.velocity_order)?;
        writeln!(out, "Viscosity:           {:.6e}", self.viscosity)?;
        writeln!(out, "Time stepping:       {}", self.method)?;
        writeln!(out)?;

        if self.cut_cells > 0 {
            writeln!(out, "IMMERSED BOUNDARY")?;
            writeln!(out, "{}", "-".repeat(60))?;
            writeln!(out, "Cut cells:           {}", self.cut_cells)?;
            writeln!(out, "Rewritten rows:      {}", self.stencil_rows)?;
            writeln!(out, "Lookup misses:       {}", self.lookup_misses)?;
            writeln!(out)?;
        }

        if self.steps > 0 {
            writeln!(out, "SOLVER PERFORMANCE")?;
            writeln!(out, "{}", "-".repeat(60))?;
            writeln!(out, "Steps:               {}", self.steps)?;
            writeln!(out, "Newton iterations:   {}", self.newton_iterations)?;
            writeln!(out, "Linear iterations:   {}", self.linear_iterations)?;
            writeln!(out, "Jacobian assemblies: {}", self.jacobian_assemblies)?;
            writeln!(out, "Step retries:        {}", self.step_retries)?;
            if let Some(res) = self.final_residual {
                writeln!(out, "Final residual:      {:.6e}", res)?;
            }
            if let Some(t) = self.final_time {
                writeln!(out, "Final time:          {:.6e}", t)?;
            }
            if let Some(cfl) = self.max_cfl {
                writeln!(out, "Max CFL:             {:.6e}", cfl)?;
            }
            writeln!(out)?;
        }

        if let (Some(ke), Some(ens)) = (self.kinetic_energy, self.enstrophy) {
            writeln!(out, "FLOW STATISTICS")?;
            writeln!(out, "{}", "-".repeat(60))?;
            writeln!(out, "Kinetic energy:      {:.6e}", ke)?;
            writeln!(out, "Enstrophy:           {:.6e}", ens)?;
            writeln!(out)?;
        }

        writeln!(out, "{}", "=".repeat(60))?;
        Ok(())
    }

    pub fn print_to_console(&self) {
        println!("\n{}", "=".repeat(60));
        println!("SIMULATION SUMMARY");
        println!("{}", "=".repeat(60));
        println!(
            "Mesh:          {} cells, {} dofs ({}D)",
            self.num_cells, self.num_dofs, self.dim
        );
        println!("Element:       Q{}, nu = {:.3e}", self.velocity_order, self.viscosity);
        if self.cut_cells > 0 {
            println!(
                "Immersed:      {} cut cells, {} rows, {} misses",
                self.cut_cells, self.stencil_rows, self.lookup_misses
            );
        }
        if self.steps > 0 {
            println!(
                "Iterations:    newton={}, linear={}, retries={}",
                self.newton_iterations, self.linear_iterations, self.step_retries
            );
        }
        if let Some(res) = self.final_residual {
            println!("Residual:      {:.3e}", res);
        }
        if let (Some(ke), Some(ens)) = (self.kinetic_energy, self.enstrophy) {
            println!("KE/enstrophy:  {:.4e} / {:.4e}", ke, ens);
        }
        println!("{}\n", "=".repeat(60));
    }
}
