use std::path::PathBuf;

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand, ValueEnum};
use geo::{Coord, Rect, coord};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use meridian_mapfile::MagnificationLevel;
use meridian_mapfile::area_index::AreaIndexReader;
use meridian_mapfile::import::ImportParameter;
use meridian_mapfile::water::{CellContent, State, WaterIndexReader};
use meridian_router::description::{
    Description, DirectionPostprocessor, DistanceAndTimePostprocessor, NameChangedPostprocessor,
    Postprocessor, RouteDescription, StartTargetPostprocessor, postprocess,
};
use meridian_router::profile::{
    FastestPathProfile, RoutingProfile, ShortestPathProfile, SpeedTable, Vehicle,
};
use meridian_router::service::{AREA_INDEX_FILE, MultiDatabaseRouter, RoutingParameter};

mod import;

#[derive(Parser, Debug)]
#[command(name = "meridian", author, version, about, long_about = None)]
struct Cli {
    /// Subcommand/tool to run
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build a region database from a JSON-lines raw extract
    Import {
        /// Raw extract, one JSON record per line
        extract: PathBuf,

        /// Directory the database files are written to
        #[arg(env = "MERIDIAN_DESTINATION")]
        destination: PathBuf,
    },
    /// Calculate a route and print turn-by-turn instructions
    Route {
        /// Region database directories
        #[arg(required = true)]
        databases: Vec<PathBuf>,

        /// Start position as lon,lat
        #[arg(long)]
        start: String,

        /// Target position as lon,lat
        #[arg(long)]
        target: String,

        #[arg(long, value_enum, default_value_t = VehicleArg::Car)]
        vehicle: VehicleArg,

        /// Optimize for travel time instead of distance
        #[arg(long)]
        fastest: bool,

        /// Speeds in km/h by way-type variant, comma separated
        #[arg(long, default_value = "50")]
        speeds: String,

        /// Vehicle maximum speed in km/h
        #[arg(long, default_value_t = 130.0)]
        max_speed: f64,

        /// Search radius around start and target, in meters
        #[arg(long, default_value_t = 1000.0)]
        radius: f64,
    },
    /// Dump the grid-index object offsets intersecting a bounding box
    Query {
        /// Region database directory
        database: PathBuf,

        /// Bounding box as minlon,minlat,maxlon,maxlat
        bbox: String,

        /// Restrict the query to these type ids
        #[arg(long)]
        types: Vec<u32>,
    },
    /// Print the water classification of the cells covering a bounding box
    Water {
        /// Region database directory
        database: PathBuf,

        /// Bounding box as minlon,minlat,maxlon,maxlat
        bbox: String,

        /// Index level to inspect
        #[arg(long, default_value_t = 10)]
        level: u32,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum VehicleArg {
    Car,
    Bicycle,
    Foot,
}

impl From<VehicleArg> for Vehicle {
    fn from(value: VehicleArg) -> Self {
        match value {
            VehicleArg::Car => Vehicle::Car,
            VehicleArg::Bicycle => Vehicle::Bicycle,
            VehicleArg::Foot => Vehicle::Foot,
        }
    }
}

fn parse_coord(input: &str) -> anyhow::Result<Coord<f64>> {
    let parts: Vec<&str> = input.split(',').collect();
    if parts.len() != 2 {
        return Err(anyhow!("Expected lon,lat but got '{input}'"));
    }
    let lon: f64 = parts[0].trim().parse().context("invalid longitude")?;
    let lat: f64 = parts[1].trim().parse().context("invalid latitude")?;
    Ok(coord! { x: lon, y: lat })
}

fn parse_bbox(input: &str) -> anyhow::Result<Rect<f64>> {
    let parts: Vec<&str> = input.split(',').collect();
    if parts.len() != 4 {
        return Err(anyhow!("Expected minlon,minlat,maxlon,maxlat but got '{input}'"));
    }
    let mut values = [0.0; 4];
    for (slot, part) in values.iter_mut().zip(&parts) {
        *slot = part.trim().parse().context("invalid bounding box value")?;
    }
    Ok(Rect::new(
        coord! { x: values[0], y: values[1] },
        coord! { x: values[2], y: values[3] },
    ))
}

fn parse_speed_table(speeds: &str, max_speed: f64) -> anyhow::Result<SpeedTable> {
    let values: Vec<f64> = speeds
        .split(',')
        .map(|s| s.trim().parse().context("invalid speed value"))
        .collect::<anyhow::Result<_>>()?;
    Ok(SpeedTable::new(values, max_speed))
}

fn print_route(description: &RouteDescription) {
    for node in &description.nodes {
        let mut instructions: Vec<String> = Vec::new();
        for entry in node.descriptions() {
            match entry {
                Description::Start { name } => {
                    instructions.push(format!("Start{}", suffix(name)));
                }
                Description::Target { name } => {
                    instructions.push(format!("Target reached{}", suffix(name)));
                }
                Description::NameChanged { target, .. } => {
                    instructions.push(format!("Continue{}", suffix(target)));
                }
                Description::Turn => {
                    let Some(Description::Direction { turn_angle }) = node.description("direction")
                    else {
                        continue;
                    };
                    let side = if *turn_angle < 0.0 { "left" } else { "right" };
                    instructions.push(format!("Turn {side}"));
                }
                _ => {}
            }
        }
        if instructions.is_empty() {
            continue;
        }
        println!("{:8.2} km  {}", node.distance_km, instructions.join("; "));
    }
}

fn suffix(name: &Option<String>) -> String {
    name.as_ref()
        .map_or_else(String::new, |n| format!(" ({n})"))
}

fn state_char(state: State) -> char {
    match state {
        State::Unknown => '?',
        State::Land => 'L',
        State::Water => 'W',
        State::Coast => 'C',
    }
}

#[expect(clippy::cast_possible_truncation)]
#[expect(clippy::cast_sign_loss)]
fn cell_range(bbox: &Rect<f64>, level: u32) -> (u32, u32, u32, u32) {
    let magnification = MagnificationLevel::new(level);
    let x_min = ((bbox.min().x + 180.0) / magnification.cell_width()).floor() as u32;
    let x_max = ((bbox.max().x + 180.0) / magnification.cell_width()).floor() as u32;
    let y_min = ((bbox.min().y + 90.0) / magnification.cell_height()).floor() as u32;
    let y_max = ((bbox.max().y + 90.0) / magnification.cell_height()).floor() as u32;
    (x_min, x_max, y_min, y_max)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        // Standard logger, configured via the RUST_LOG env variable
        .with(tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Import {
            extract,
            destination,
        } => {
            std::fs::create_dir_all(&destination).with_context(|| {
                format!("Failed to create destination at {}", destination.display())
            })?;
            let extract = import::RawExtract::read(&extract)?;
            let parameter = ImportParameter {
                destination_directory: destination,
                ..ImportParameter::default()
            };
            let report = import::build_database(&extract, parameter)?;
            for step in &report.steps {
                println!("{:>12?}  {}", step.duration, step.name);
            }
            Ok(())
        }
        Commands::Route {
            databases,
            start,
            target,
            vehicle,
            fastest,
            speeds,
            max_speed,
            radius,
        } => {
            let start = parse_coord(&start)?;
            let target = parse_coord(&target)?;
            let profile: Box<dyn RoutingProfile> = if fastest {
                Box::new(FastestPathProfile::new(
                    vehicle.into(),
                    parse_speed_table(&speeds, max_speed)?,
                ))
            } else {
                Box::new(ShortestPathProfile::new(vehicle.into()))
            };

            let router = MultiDatabaseRouter::open(&databases)?;
            let start_position = router
                .closest_routable_node(start, profile.as_ref(), radius)?
                .ok_or_else(|| anyhow!("No routable way within {radius} m of the start"))?;
            let target_position = router
                .closest_routable_node(target, profile.as_ref(), radius)?
                .ok_or_else(|| anyhow!("No routable way within {radius} m of the target"))?;
            info!(
                start_database = %start_position.database,
                target_database = %target_position.database,
                "positions resolved"
            );

            let result = router.calculate_route(
                profile.as_ref(),
                &start_position,
                &target_position,
                &RoutingParameter::default(),
            )?;
            let Some(route) = result.into_route() else {
                return Err(anyhow!("No route found"));
            };

            let mut description = router.route_description(&route)?;
            let postprocessors: Vec<Box<dyn Postprocessor>> = vec![
                Box::new(StartTargetPostprocessor {
                    start_name: None,
                    target_name: None,
                }),
                Box::new(DistanceAndTimePostprocessor { speed_km_h: 50.0 }),
                Box::new(NameChangedPostprocessor),
                Box::new(DirectionPostprocessor::default()),
            ];
            let refs: Vec<&dyn Postprocessor> =
                postprocessors.iter().map(AsRef::as_ref).collect();
            postprocess(&mut description, &refs)?;

            print_route(&description);
            Ok(())
        }
        Commands::Query {
            database,
            bbox,
            types,
        } => {
            let bbox = parse_bbox(&bbox)?;
            let mut reader = AreaIndexReader::open(&database.join(AREA_INDEX_FILE))?;
            let types = if types.is_empty() {
                reader.type_ids().collect()
            } else {
                types
            };
            let offsets = reader.offsets(&bbox, &types)?;
            let output = serde_json::json!({
                "types": types,
                "offsets": offsets,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Commands::Water {
            database,
            bbox,
            level,
        } => {
            let bbox = parse_bbox(&bbox)?;
            let mut reader = WaterIndexReader::open(&database.join(import::WATER_INDEX_FILE))?;
            let (x_min, x_max, y_min, y_max) = cell_range(&bbox, level);

            // North at the top.
            for y in (y_min..=y_max).rev() {
                let mut row = String::new();
                for x in x_min..=x_max {
                    row.push(match reader.cell(level, x, y)? {
                        CellContent::Uniform(state) => state_char(state),
                        CellContent::Tiles(_) => 'c',
                    });
                }
                println!("{row}");
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordinates_parse_as_lon_lat() {
        let c = parse_coord("13.4, 52.52").unwrap();
        assert!((c.x - 13.4).abs() < 1e-12);
        assert!((c.y - 52.52).abs() < 1e-12);
        assert!(parse_coord("13.4").is_err());
    }

    #[test]
    fn bounding_boxes_need_four_values() {
        let bbox = parse_bbox("13.0,52.0,13.5,52.6").unwrap();
        assert!((bbox.min().x - 13.0).abs() < 1e-12);
        assert!((bbox.max().y - 52.6).abs() < 1e-12);
        assert!(parse_bbox("13.0,52.0,13.5").is_err());
    }

    #[test]
    fn speed_tables_parse_from_comma_lists() {
        let table = parse_speed_table("30, 50,100", 90.0).unwrap();
        assert!((table.speed(1) - 50.0).abs() < 1e-12);
        assert!((table.speed(2) - 90.0).abs() < 1e-12);
        assert!(parse_speed_table("fast", 90.0).is_err());
    }
}
