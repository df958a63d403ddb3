use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueHint};
use pwc_telemetry::{
    calculate_telemetry, parse_trace, write_series, write_series_stdout, Curve, EnrichedSeries,
    Profile, ProfileStore, RideConditions, Trace,
};
use rayon::prelude::*;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "PWC telemetry processor: synthesize RPM and fuel from GPS speed", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate RPM / fuel telemetry for one or more FIT/GPX/MP4 files
    Process(ProcessArgs),
    /// Summarize the speed trace found in each input without a profile
    Inspect(InspectArgs),
    /// List, show, edit or remove calibration profiles
    Profiles(ProfilesArgs),
}

#[derive(Args, Debug, Clone)]
struct StoreArgs {
    /// Profile document (JSON)
    #[arg(long = "profiles", env = "PWC_PROFILES", default_value = "profiles.json", value_hint = ValueHint::FilePath)]
    path: PathBuf,
}

#[derive(Parser, Debug)]
struct ProcessArgs {
    /// FIT/GPX/MP4 files to ingest
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// Output path (.csv or .xlsx, `-` for CSV on stdout); single input only.
    /// Defaults to `<input stem>_telemetry.csv` next to each input.
    #[arg(short, long, value_hint = ValueHint::FilePath)]
    output: Option<PathBuf>,

    #[command(flatten)]
    store: StoreArgs,

    /// Profile name (defaults to the first profile in the document)
    #[arg(short, long)]
    profile: Option<String>,

    /// Rider weight in kg
    #[arg(long, default_value_t = 77.0)]
    weight: f64,

    /// Engine size (1.8L|1.9L, or small|large)
    #[arg(long, default_value = "1.8L")]
    engine: String,

    /// Fuel load (full|half|low)
    #[arg(long, default_value = "full")]
    fuel: String,

    /// Drive mode (normal|l-mode|no-wake)
    #[arg(long, default_value = "normal")]
    drive_mode: String,

    /// Water condition (calm|rough)
    #[arg(long, default_value = "calm")]
    water: String,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct InspectArgs {
    /// FIT/GPX/MP4 files to inspect
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct ProfilesArgs {
    #[command(flatten)]
    store: StoreArgs,

    #[command(subcommand)]
    action: ProfileAction,
}

#[derive(Subcommand, Debug)]
enum ProfileAction {
    /// List profile names
    List,
    /// Print both curves of a profile
    Show { name: String },
    /// Create or replace a profile and save the document
    Set {
        name: String,
        /// Speed→RPM points as `mph:rpm,mph:rpm,...`
        #[arg(long)]
        rpm_model: String,
        /// RPM→fuel points as `rpm:lph,rpm:lph,...`
        #[arg(long)]
        fuel_model: String,
    },
    /// Remove a profile and save the document
    Remove { name: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Process(args) => args.verbose,
        Command::Inspect(args) => args.verbose,
        Command::Profiles(_) => false,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Process(args) => handle_process(args),
        Command::Inspect(args) => handle_inspect(args),
        Command::Profiles(args) => handle_profiles(args),
    }
}

fn handle_process(args: ProcessArgs) -> Result<()> {
    if args.output.is_some() && args.inputs.len() > 1 {
        return Err(anyhow!("--output can only be used with a single input"));
    }

    let conditions = RideConditions::parse(
        args.weight,
        &args.engine,
        &args.fuel,
        &args.drive_mode,
        &args.water,
    )?;

    let store = ProfileStore::load(&args.store.path)
        .with_context(|| "profiles are required to generate telemetry")?;
    let profile = match args.profile.as_deref() {
        Some(name) => store.get(name)?,
        None => store
            .first()
            .ok_or_else(|| anyhow!("{} contains no profiles", args.store.path.display()))?,
    };
    info!("Using profile: {}", profile.name);
    info!("Ride conditions: {}", conditions);
    debug!("Total correction factor: {:.4}", conditions.total_factor());

    let t_run = Instant::now();
    let results: Vec<(PathBuf, Result<EnrichedSeries>)> = args
        .inputs
        .par_iter()
        .map(|path| (path.clone(), run_engine(path, profile, &conditions)))
        .collect();
    debug!(
        "Parse + calculate stage: {:.1} ms",
        t_run.elapsed().as_secs_f64() * 1000.0
    );

    let mut failures = 0usize;
    for (input, result) in results {
        let outcome = result.and_then(|series| {
            let destination = args
                .output
                .clone()
                .unwrap_or_else(|| default_output_path(&input));
            write_output(&series, &destination)
        });
        if let Err(err) = outcome {
            failures += 1;
            error!("{}: {:#}", input.display(), err);
        }
    }

    if failures > 0 {
        bail!("{} of {} input(s) failed", failures, args.inputs.len());
    }
    Ok(())
}

fn read_trace(path: &Path) -> Result<Trace> {
    info!("Parsing {}...", path.display());
    let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let hint = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default();
    let trace =
        parse_trace(&data, hint).with_context(|| format!("failed to parse {}", path.display()))?;
    info!(
        "Successfully parsed {} data points from {}",
        trace.len(),
        path.display()
    );
    Ok(trace)
}

fn run_engine(path: &Path, profile: &Profile, conditions: &RideConditions) -> Result<EnrichedSeries> {
    let trace = read_trace(path)?;
    let series = calculate_telemetry(&trace, profile, conditions)
        .with_context(|| format!("failed to calculate telemetry for {}", path.display()))?;
    info!(
        "{}: {} samples, max {} rpm, {:.3} L over {:.0} s",
        path.display(),
        series.len(),
        series.max_rpm().unwrap_or_default(),
        series.total_fuel_l(),
        series.duration_s()
    );
    Ok(series)
}

fn default_output_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    input.with_file_name(format!("{}_telemetry.csv", stem))
}

fn write_output(series: &EnrichedSeries, destination: &Path) -> Result<()> {
    if destination.as_os_str() == "-" {
        write_series_stdout(series)?;
        return Ok(());
    }
    let format = write_series(series, destination)?;
    info!(
        "SUCCESS! Telemetry ({}) saved to {}",
        format.extension(),
        destination.display()
    );
    Ok(())
}

fn handle_inspect(args: InspectArgs) -> Result<()> {
    let mut report = String::new();
    let mut failures = 0usize;

    for path in &args.inputs {
        match read_trace(path) {
            Ok(trace) => {
                report.push_str(&format!("FILE: {}\n", path.display()));
                report.push_str(&format!("  samples: {}\n", trace.len()));
                report.push_str(&format!(
                    "  start: {}\n",
                    trace.start().format("%Y-%m-%dT%H:%M:%S%.3fZ")
                ));
                report.push_str(&format!("  timespan_s: {:.1}\n", trace.span_s()));
                report.push_str(&format!(
                    "  max_speed_kmh: {:.2}\n",
                    trace.max_speed_kmh()
                ));
                report.push_str(&format!(
                    "  mean_speed_kmh: {:.2}\n",
                    trace.mean_speed_kmh()
                ));
                report.push('\n');
            }
            Err(err) => {
                failures += 1;
                error!("{:#}", err);
            }
        }
    }

    print!("{}", report);
    if failures > 0 {
        bail!("{} of {} input(s) could not be read", failures, args.inputs.len());
    }
    Ok(())
}

fn handle_profiles(args: ProfilesArgs) -> Result<()> {
    let path = &args.store.path;
    match args.action {
        ProfileAction::List => {
            let store = ProfileStore::load_or_default(path);
            if store.is_empty() {
                warn!("No profiles in {}", path.display());
            }
            for name in store.names() {
                println!("{}", name);
            }
        }
        ProfileAction::Show { name } => {
            let store = ProfileStore::load(path)?;
            let profile = store.get(&name)?;
            println!("{}", profile.name);
            println!("  RPM model (speed mph -> rpm):");
            for (mph, rpm) in profile.rpm_curve.points() {
                println!("    {:>8} -> {}", mph, rpm);
            }
            println!("  Fuel model (rpm -> L/h):");
            for (rpm, lph) in profile.fuel_curve.points() {
                println!("    {:>8} -> {}", rpm, lph);
            }
        }
        ProfileAction::Set {
            name,
            rpm_model,
            fuel_model,
        } => {
            let mut store = ProfileStore::load_or_default(path);
            let rpm_curve = Curve::new(
                &format!("{name}/rpm_model"),
                &parse_point_list(&rpm_model).context("invalid --rpm-model")?,
            )?;
            let fuel_curve = Curve::new(
                &format!("{name}/fuel_model"),
                &parse_point_list(&fuel_model).context("invalid --fuel-model")?,
            )?;
            let replaced = store.insert(Profile::new(name.clone(), rpm_curve, fuel_curve));
            store.save(path)?;
            if replaced.is_some() {
                info!("Profile '{}' updated", name);
            } else {
                info!("Profile '{}' created", name);
            }
        }
        ProfileAction::Remove { name } => {
            let mut store = ProfileStore::load(path)?;
            store.remove(&name)?;
            store.save(path)?;
            info!("Profile '{}' removed", name);
        }
    }
    Ok(())
}

/// Parse `x:y,x:y,...` control points.
fn parse_point_list(input: &str) -> Result<Vec<(f64, f64)>> {
    let mut out = Vec::new();
    for token in input.split(',') {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            continue;
        }
        let (x, y) = trimmed
            .split_once(':')
            .ok_or_else(|| anyhow!("invalid point '{}': expected x:y", trimmed))?;
        let x: f64 = x
            .trim()
            .parse()
            .with_context(|| format!("invalid x value in '{}'", trimmed))?;
        let y: f64 = y
            .trim()
            .parse()
            .with_context(|| format!("invalid y value in '{}'", trimmed))?;
        out.push((x, y));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_point_list() {
        let points = parse_point_list("0:1000, 10:3000,30:5000,").unwrap();
        assert_eq!(points, vec![(0.0, 1000.0), (10.0, 3000.0), (30.0, 5000.0)]);
        assert!(parse_point_list("0-1000").is_err());
        assert!(parse_point_list("a:1").is_err());
        assert!(parse_point_list("").unwrap().is_empty());
    }

    #[test]
    fn test_default_output_path_sits_next_to_input() {
        let path = default_output_path(Path::new("/rides/2024-06-01.gpx"));
        assert_eq!(path, PathBuf::from("/rides/2024-06-01_telemetry.csv"));
    }

    #[test]
    fn test_cli_defaults_match_form_defaults() {
        let cli = Cli::try_parse_from(["pwc-telemetry", "process", "ride.gpx"]).unwrap();
        let Command::Process(args) = cli.command else {
            panic!("expected process command");
        };
        let conditions = RideConditions::parse(
            args.weight,
            &args.engine,
            &args.fuel,
            &args.drive_mode,
            &args.water,
        )
        .unwrap();
        assert_eq!(conditions, RideConditions::default());
        assert!(args.output.is_none());
    }

    #[test]
    fn test_process_and_profiles_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let profiles = dir.path().join("profiles.json");
        handle_profiles(ProfilesArgs {
            store: StoreArgs {
                path: profiles.clone(),
            },
            action: ProfileAction::Set {
                name: "Test".into(),
                rpm_model: "0:1000,30:5000".into(),
                fuel_model: "1000:2,5000:10".into(),
            },
        })
        .unwrap();

        let gpx = dir.path().join("ride.gpx");
        fs::write(
            &gpx,
            r#"<?xml version="1.0"?>
<gpx version="1.1" creator="test" xmlns="http://www.topografix.com/GPX/1/1">
  <trk><trkseg>
    <trkpt lat="0.0" lon="0.0"><time>2024-06-01T10:00:00Z</time></trkpt>
    <trkpt lat="0.0" lon="0.0005"><time>2024-06-01T10:00:05Z</time></trkpt>
  </trkseg></trk>
</gpx>"#,
        )
        .unwrap();

        let cli = Cli::try_parse_from([
            "pwc-telemetry",
            "process",
            gpx.to_str().unwrap(),
            "--profiles",
            profiles.to_str().unwrap(),
            "--drive-mode",
            "No-Wake",
        ])
        .unwrap();
        let Command::Process(args) = cli.command else {
            panic!("expected process command");
        };
        handle_process(args).unwrap();

        let written = fs::read_to_string(dir.path().join("ride_telemetry.csv")).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("2024-06-01T10:00:00.000Z,0,"));
    }

    #[test]
    fn test_process_rejects_bad_condition_value() {
        let cli = Cli::try_parse_from([
            "pwc-telemetry",
            "process",
            "ride.gpx",
            "--water",
            "choppy",
        ])
        .unwrap();
        let Command::Process(args) = cli.command else {
            panic!("expected process command");
        };
        let err = handle_process(args).unwrap_err();
        assert!(err.to_string().contains("water condition"));
    }
}
