use crate::boundary::{build_boundary, write_boundary_geojson, write_coordinate_minmax, BoundaryParams, PreparedBoundary};
use crate::density::{classify_density, DensityClassifierConfig};
use crate::errors::ConfigError;
use crate::hexgrid::{hex_area, HexGridAggregator};
use crate::regionfilter::RegionFilter;
use crate::tsv::{check_input_file, check_output_dir, open_tsv_reader, parse_field, warn_if_exists, Schema};

use clap::Args;
use log::{info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashSet;
use std::path::Path;

#[derive(Args, Debug, Clone)]
pub struct FilterArgs {
    #[arg(long, help = "Tab-delimited molecule file with columns X, Y and the --filter-based-on key (plus 'gene' if --feature is given)")]
    input: String,

    #[arg(long, help = "Filtered copy of the input (required unless --boundary-only)")]
    output: Option<String>,

    #[arg(long, help = "Prefix for output boundary files")]
    output_boundary: String,

    #[arg(long, help = "Feature list (tab-delimited with a 'gene' column) to restrict to")]
    feature: Option<String>,

    #[arg(long, default_value = "Count")]
    filter_based_on: String,

    #[arg(long, default_value_t = 26.67, help = "Coordinate to micron translation")]
    mu_scale: f64,

    #[arg(long, default_value_t = 1_000_000)]
    max_npts_to_fit_model: usize,

    #[arg(long, default_value_t = 0.5, help = "Lower bound for the dense tissue density (molecules per square micron)")]
    min_abs_mol_density_squm_dense: f64,

    #[arg(long, default_value_t = 0.02, help = "Density below which hexagons are discarded as noise before fitting")]
    min_abs_mol_density_squm: f64,

    #[arg(long, help = "Use this strict density threshold (molecules per square micron) instead of the fitted one")]
    hard_threshold: Option<f64>,

    #[arg(long, help = "Remove isolated polygons with area (square micron) at most this")]
    remove_small_polygons: Option<f64>,

    #[arg(long, default_value_t = 15.0, help = "Hexagon radius in microns")]
    radius: f64,

    #[arg(long, default_value_t = 2)]
    hex_n_move: usize,

    #[arg(long, help = "Maximum triangle edge length (default: twice the hexagon width)")]
    max_edge: Option<f64>,

    #[arg(long, default_value_t = false)]
    boundary_only: bool,

    #[arg(long, default_value_t = 500_000)]
    chunk_size: usize,

    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct FilterConfig {
    pub input: String,
    pub output: Option<String>,
    pub output_boundary: String,
    pub feature: Option<String>,
    pub key: String,
    pub mu_scale: f64,
    pub radius: f64,
    pub hex_n_move: usize,
    pub min_density: f64,
    pub classifier: DensityClassifierConfig,
    pub remove_small_polygons: f64,
    pub max_edge_len: f64,
    pub boundary_only: bool,
    pub chunk_size: usize,
    pub seed: Option<u64>,
}

impl FilterConfig {
    pub fn from_args(args: &FilterArgs) -> Result<FilterConfig, ConfigError> {
        check_input_file(&args.input)?;
        check_output_dir(&args.output_boundary)?;

        if !args.boundary_only {
            match &args.output {
                Some(output) => check_output_dir(output)?,
                None => {
                    return Err(ConfigError::InvalidArgument {
                        arg: "output",
                        reason: "required unless --boundary-only is set".to_string(),
                    })
                }
            }
        }

        if args.radius <= 0.0 {
            return Err(ConfigError::InvalidArgument {
                arg: "radius",
                reason: format!("must be positive, got {}", args.radius),
            });
        }
        if args.mu_scale <= 0.0 {
            return Err(ConfigError::InvalidArgument {
                arg: "mu-scale",
                reason: format!("must be positive, got {}", args.mu_scale),
            });
        }
        if args.hex_n_move == 0 {
            return Err(ConfigError::InvalidArgument {
                arg: "hex-n-move",
                reason: "must be at least 1".to_string(),
            });
        }
        if args.chunk_size == 0 {
            return Err(ConfigError::InvalidArgument {
                arg: "chunk-size",
                reason: "must be at least 1".to_string(),
            });
        }

        let hex_diam = args.radius * 3_f64.sqrt();
        let max_edge_len = match args.max_edge {
            Some(max_edge) if max_edge > 0.0 => max_edge,
            _ => 2.0 * hex_diam,
        };

        Ok(FilterConfig {
            input: args.input.clone(),
            output: args.output.clone(),
            output_boundary: args.output_boundary.clone(),
            feature: args.feature.clone(),
            key: args.filter_based_on.clone(),
            mu_scale: args.mu_scale,
            radius: args.radius,
            hex_n_move: args.hex_n_move,
            min_density: args.min_abs_mol_density_squm,
            classifier: DensityClassifierConfig {
                max_npts_to_fit_model: args.max_npts_to_fit_model,
                min_density_dense: args.min_abs_mol_density_squm_dense,
                hard_threshold: args.hard_threshold.filter(|&h| h > 0.0),
            },
            remove_small_polygons: args.remove_small_polygons.unwrap_or(-1.0),
            max_edge_len,
            boundary_only: args.boundary_only,
            chunk_size: args.chunk_size,
            seed: args.seed,
        })
    }
}

pub fn read_feature_set(path: &str) -> anyhow::Result<HashSet<String>> {
    let mut rdr = open_tsv_reader(path)?;
    let schema = Schema::from_reader(&mut rdr, path)?;
    let gene_col = schema.require("gene")?;
    let mut features = HashSet::new();
    for record in rdr.records() {
        let record = record?;
        if let Some(gene) = record.get(gene_col) {
            features.insert(gene.to_string());
        }
    }
    Ok(features)
}

// Bin every molecule into the overlapping hexagon grids.
fn aggregate_hexagons(config: &FilterConfig, features: Option<&HashSet<String>>) -> anyhow::Result<HexGridAggregator> {
    let mut rdr = open_tsv_reader(&config.input)?;
    let schema = Schema::from_reader(&mut rdr, &config.input)?;
    let x_col = schema.require("X")?;
    let y_col = schema.require("Y")?;
    let key_col = schema.require(&config.key)?;
    let gene_col = match features {
        Some(_) => Some(schema.require("gene")?),
        None => None,
    };

    let mut grid = HexGridAggregator::new(config.radius, config.hex_n_move);
    let mut record = csv::StringRecord::new();
    let mut nrecords: usize = 0;
    while rdr.read_record(&mut record)? {
        if let (Some(features), Some(gene_col)) = (features, gene_col) {
            if !record.get(gene_col).is_some_and(|g| features.contains(g)) {
                continue;
            }
        }
        let x: f64 = parse_field(&record, x_col, "X")?;
        let y: f64 = parse_field(&record, y_col, "Y")?;
        let value: f64 = parse_field(&record, key_col, &config.key)?;
        grid.add(x / config.mu_scale, y / config.mu_scale, value);
        nrecords += 1;
    }

    info!(
        "Read {} records into {} hexagons over {} shifted grids",
        nrecords,
        grid.len(),
        grid.ngrids()
    );
    Ok(grid)
}

pub fn run_filter_by_density(args: &FilterArgs) -> anyhow::Result<()> {
    let config = FilterConfig::from_args(args)?;

    let features = match &config.feature {
        Some(path) if Path::new(path).is_file() => Some(read_feature_set(path)?),
        Some(path) => {
            warn!("Feature file '{}' not found, using all features", path);
            None
        }
        None => None,
    };

    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };

    let area = hex_area(config.radius);
    let grid = aggregate_hexagons(&config, features.as_ref())?;
    let cells: Vec<_> = grid
        .into_cells()
        .into_iter()
        .filter(|c| c.value >= area * config.min_density)
        .collect();
    info!("Collapsed to {} hexagons", cells.len());

    let densities: Vec<f64> = cells.iter().map(|c| c.value / area).collect();
    let fit = classify_density(&densities, &config.classifier, &mut rng)?;
    let thresholds = fit.thresholds;
    info!(
        "{} of {} hexagons look like tissue, mean density {:.3} v.s. {:.3} in background",
        fit.tissue.iter().filter(|&&t| t).count(),
        cells.len(),
        fit.tissue_mean,
        fit.background_mean
    );
    info!(
        "Tissue density min {:.3}, median {:.3}",
        fit.tissue_min, fit.tissue_median
    );

    let centers_above = |cut: f64| -> Vec<(f64, f64)> {
        cells
            .iter()
            .filter(|c| c.value > cut * area)
            .map(|c| (c.center_x, c.center_y))
            .collect()
    };

    let strict = build_boundary(
        &centers_above(thresholds.strict),
        &BoundaryParams {
            max_edge_len: config.max_edge_len,
            buffer: 5.0,
            min_polygon_area: config.remove_small_polygons,
        },
    )?;
    write_boundary_geojson(&format!("{}.boundary.strict.geojson", config.output_boundary), &strict)?;

    let lenient = build_boundary(
        &centers_above(thresholds.lenient),
        &BoundaryParams {
            max_edge_len: config.max_edge_len,
            buffer: config.radius,
            min_polygon_area: config.remove_small_polygons.min(area * 4.0),
        },
    )?;
    write_boundary_geojson(&format!("{}.boundary.lenient.geojson", config.output_boundary), &lenient)?;
    write_coordinate_minmax(&format!("{}.coordinate_minmax.tsv", config.output_boundary), &lenient)?;

    if config.boundary_only {
        return Ok(());
    }

    let output = match &config.output {
        Some(output) => output,
        None => return Ok(()),
    };
    warn_if_exists(output);

    let prepared = PreparedBoundary::new(&lenient);
    let filter = RegionFilter {
        boundary: &prepared,
        mu_scale: config.mu_scale,
        features: features.as_ref(),
        chunk_size: config.chunk_size,
    };
    let nwritten = filter.filter_file(&config.input, output)?;
    info!("Kept {} rows inside the lenient boundary", nwritten);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tsv::TsvWriter;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct TestCli {
        #[command(flatten)]
        args: FilterArgs,
    }

    // Dense 200x200 micron square of molecules plus a sparse background.
    fn write_molecules(input: &str) {
        let mut w = TsvWriter::create(input).unwrap();
        w.write_record(["X", "Y", "gene", "Count"]).unwrap();
        for i in 0..100 {
            for j in 0..100 {
                let (x, y) = (100.0 + 2.0 * i as f64, 100.0 + 2.0 * j as f64);
                w.write_record([format!("{}", x), format!("{}", y), "A".to_string(), "3".to_string()])
                    .unwrap();
            }
        }
        for i in 0..20 {
            for j in 0..20 {
                let (x, y) = (25.0 * i as f64, 25.0 * j as f64);
                w.write_record([format!("{}", x), format!("{}", y), "B".to_string(), "1".to_string()])
                    .unwrap();
            }
        }
        w.finish().unwrap();
    }

    #[test]
    fn test_end_to_end_boundary_and_filter() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("molecules.tsv.gz");
        let input = input.to_str().unwrap().to_string();
        let prefix = dir.path().join("sample").to_str().unwrap().to_string();
        let output = dir.path().join("filtered.tsv.gz").to_str().unwrap().to_string();
        write_molecules(&input);

        let cli = TestCli::parse_from([
            "test",
            "--input",
            &input,
            "--output",
            &output,
            "--output-boundary",
            &prefix,
            "--mu-scale",
            "1",
            "--min-abs-mol-density-squm",
            "0.0001",
            "--seed",
            "5",
        ]);
        run_filter_by_density(&cli.args).unwrap();

        assert!(Path::new(&format!("{}.boundary.strict.geojson", prefix)).exists());
        assert!(Path::new(&format!("{}.boundary.lenient.geojson", prefix)).exists());
        let minmax = std::fs::read_to_string(format!("{}.coordinate_minmax.tsv", prefix)).unwrap();
        assert_eq!(minmax.lines().count(), 4);
        assert!(minmax.starts_with("xmin\t"));

        let mut rdr = open_tsv_reader(&output).unwrap();
        let records: Vec<csv::StringRecord> = rdr.records().map(|r| r.unwrap()).collect();
        assert!(records.iter().filter(|r| &r[2] == "A").count() > 9000);
        assert!(records.iter().filter(|r| &r[2] == "B").count() < 150);
    }

    #[test]
    fn test_boundary_only_skips_filtered_output() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("molecules.tsv.gz");
        let input = input.to_str().unwrap().to_string();
        let prefix = dir.path().join("sample").to_str().unwrap().to_string();
        write_molecules(&input);

        let cli = TestCli::parse_from([
            "test",
            "--input",
            &input,
            "--output-boundary",
            &prefix,
            "--mu-scale",
            "1",
            "--min-abs-mol-density-squm",
            "0.0001",
            "--boundary-only",
            "--seed",
            "5",
        ]);
        run_filter_by_density(&cli.args).unwrap();

        let mut files: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        files.sort();
        assert_eq!(
            files,
            vec![
                "molecules.tsv.gz",
                "sample.boundary.lenient.geojson",
                "sample.boundary.strict.geojson",
                "sample.coordinate_minmax.tsv",
            ]
        );
    }

    #[test]
    fn test_chunk_size_error_names_chunk_size() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("molecules.tsv");
        std::fs::write(&input, "X\tY\tCount\n1\t1\t1\n").unwrap();
        let cli = TestCli::parse_from([
            "test",
            "--input",
            input.to_str().unwrap(),
            "--output-boundary",
            dir.path().join("sample").to_str().unwrap(),
            "--boundary-only",
            "--chunk-size",
            "0",
        ]);
        assert!(matches!(
            FilterConfig::from_args(&cli.args),
            Err(ConfigError::InvalidArgument { arg: "chunk-size", .. })
        ));
    }

    #[test]
    fn test_output_required_without_boundary_only() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("molecules.tsv");
        std::fs::write(&input, "X\tY\tCount\n1\t1\t1\n").unwrap();
        let cli = TestCli::parse_from([
            "test",
            "--input",
            input.to_str().unwrap(),
            "--output-boundary",
            dir.path().join("sample").to_str().unwrap(),
        ]);
        assert!(matches!(
            FilterConfig::from_args(&cli.args),
            Err(ConfigError::InvalidArgument { arg: "output", .. })
        ));
    }
}
