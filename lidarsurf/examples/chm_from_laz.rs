use anyhow::{Context, Result};
use lidarsurf::collect::pdal::classification::{ClassificationConfig, ClothSimulationParams, GroundFilter};
use lidarsurf::{Lidar, PointCloudSource, Settings};

/// Example: canopy height model from a LAZ tile
///
/// Usage: cargo run --example chm_from_laz -- <tile.laz> [settings.json]
/// Needs `pdal` on PATH, or LIDARSURF_PDAL pointing to it.
fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args().skip(1);
    let input = args
        .next()
        .context("usage: chm_from_laz <tile.laz> [settings.json]")?;
    let settings = match args.next() {
        Some(path) => Settings::from_json_file(&path)
            .with_context(|| format!("Failed to load settings from {path}"))?,
        None => Settings::default(),
    }
    .with_env_overrides()?;

    println!("=== Example: CHM from {input} ===\n");

    let source = PointCloudSource::open(&input).context("Failed to open point cloud")?;
    println!("Point cloud:");
    println!("  - Points: {:?}", source.point_count);
    println!(
        "  - CRS: {}",
        source
            .crs
            .as_ref()
            .map_or_else(|| "unknown".to_string(), |c| c.to_string())
    );
    println!("  - Size: {} bytes\n", source.file_size);

    // Cloth simulation tuned for flat, open terrain
    let classification = ClassificationConfig::new(GroundFilter::ClothSimulation(ClothSimulationParams {
        threshold: 0.35,
        resolution: 1.0,
        rigidness: 1,
        iterations: 500,
        ..Default::default()
    }));

    let lidar = Lidar::new(settings)?;
    let product = lidar
        .chm(&source, &classification)
        .context("Failed to compute the canopy height model")?;

    let report = &product.height.report;
    println!("Canopy height model:");
    println!("  - Alignment: {:?}", product.plan.relation());
    println!(
        "  - Size: {}x{}",
        product.height.grid.width(),
        product.height.grid.height()
    );
    println!("  - Mean height: {:.2} m", report.mean.unwrap_or(f64::NAN));
    println!("  - Max height: {:.2} m", report.max.unwrap_or(f64::NAN));
    println!("  - Nodata: {:.1}%", report.nodata_fraction * 100.0);
    if report.implausible {
        println!("  - WARNING: {}", report.issues.join("; "));
    }

    let paths = lidar.write_products(&source, &product, None)?;
    println!("\nProducts saved:");
    println!("  - DTM: {:?}", paths.dtm);
    println!("  - DSM: {:?}", paths.dsm);
    println!("  - CHM: {:?}", paths.chm);
    println!("  - Report: {:?}", paths.report);

    Ok(())
}
