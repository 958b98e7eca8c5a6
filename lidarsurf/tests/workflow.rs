mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use common::{ascii_store, lambert93, laz_file, noisy_grid, Behaviour, FakeEngine};
use lidarsurf::collect::global_variables::NODATA;
use lidarsurf::collect::pdal::pipeline::{build, SurfaceRequest};
use lidarsurf::config::{AlignOptions, FillOptions, QualityThresholds};
use lidarsurf::geometric::align::{align, AlignmentPlan, AlignmentRelation};
use lidarsurf::geometric::chm::difference;
use lidarsurf::geometric::fill::fill;
use lidarsurf::raster::grid::CropWindow;
use lidarsurf::{
    CachePolicy, ClassificationConfig, Executor, Grid, GridGeometry, Lidar, PointCloudSource, Settings,
};

fn csf_request() -> SurfaceRequest {
    let params: BTreeMap<String, f64> = [
        ("threshold", 0.35),
        ("resolution", 1.0),
        ("rigidness", 1.0),
        ("iterations", 500.0),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();
    SurfaceRequest::ground(1.0, ClassificationConfig::from_params("csf", &params).unwrap())
}

#[test]
fn test_cloth_simulation_ground_raster() {
    let dir = tempfile::tempdir().unwrap();
    let input = laz_file(dir.path(), "tile.laz", b"points");
    // Ground points only cover the western half of the tile
    let engine = Arc::new(FakeEngine::with_surface(Behaviour::Succeed, |_, resolution| {
        let geometry = GridGeometry::north_up(650_000.0, 6_860_010.0, resolution, 10, 10, None);
        let data = (0..100).map(|i| if i % 10 < 5 { 42.0 } else { NODATA }).collect();
        Grid::new(geometry, data, NODATA).unwrap()
    }));
    let executor = Executor::new(engine.clone(), ascii_store(), Duration::from_secs(5));

    let source = PointCloudSource::with_crs(&input, lambert93()).unwrap();
    let description = build(&source, &csf_request()).unwrap();
    let grid = executor.execute(&description, CachePolicy::Use).unwrap();

    let pipeline = engine.last_pipeline().unwrap();
    let csf = &pipeline["pipeline"][3];
    assert_eq!(csf["type"], "filters.csf");
    assert_eq!(csf["threshold"], 0.35);
    assert_eq!(csf["rigidness"], 1);
    assert_eq!(csf["iterations"], 500);
    let writer = &pipeline["pipeline"][5];
    assert_eq!(writer["resolution"], 1.0);
    assert_eq!(writer["nodata"], -9999.0);
    assert_eq!(writer["gdaldriver"], "AAIGrid");

    assert_eq!(grid.geometry().pixel_width, 1.0);
    assert_eq!(grid.geometry().pixel_height, -1.0);
    assert_eq!(grid.crs(), lambert93().as_ref());
    assert_eq!(grid.nodata(), -9999.0);
    assert_eq!(grid.value(0, 7), None);
    assert_eq!(grid.value(0, 2), Some(42.0));
}

#[test]
fn test_chm_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let input = laz_file(dir.path(), "survey.copc.laz", b"points");
    let engine = Arc::new(FakeEngine::new(Behaviour::Succeed));
    let settings = Settings {
        output_dir: dir.path().join("out"),
        ..Settings::default()
    };
    let executor = Executor::new(engine.clone(), ascii_store(), Duration::from_secs(5))
        .with_memory_cache(dir.path().join("cache"));
    let lidar = Lidar::with_executor(settings, executor);

    let source = PointCloudSource::with_crs(&input, lambert93()).unwrap();
    let product = lidar.chm(&source, &ClassificationConfig::default()).unwrap();
    assert_eq!(engine.runs(), 2);
    assert_eq!(product.plan, AlignmentPlan::Identical);
    assert!(product.height.grid.data().iter().all(|v| *v == 15.0));
    assert!(!product.height.report.implausible);

    // Both rasters are cached now
    lidar.chm(&source, &ClassificationConfig::default()).unwrap();
    assert_eq!(engine.runs(), 2);

    let paths = lidar.write_products(&source, &product, None).unwrap();
    assert_eq!(paths.chm, dir.path().join("out").join("survey_chm.asc"));
    for path in [&paths.dtm, &paths.dsm, &paths.chm, &paths.report] {
        assert!(path.is_file(), "{path:?} missing");
    }
    let report: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&paths.report).unwrap()).unwrap();
    assert_eq!(report["plan"]["relation"], "Identical");
    assert_eq!(report["quality"]["mean"], 15.0);

    assert_eq!(lidar.clear_cache(&source).unwrap(), 2);
}

#[test]
fn test_resample_scenario() {
    let top = Grid::filled(
        GridGeometry::north_up(0.0, 100.0, 1.0, 100, 100, lambert93()),
        50.0,
    )
    .unwrap();
    let ground = Grid::filled(
        GridGeometry::north_up(0.0, 100.0, 2.0, 50, 50, lambert93()),
        10.0,
    )
    .unwrap();
    let (plan, t, g) = align(&top, &ground, &AlignOptions::default()).unwrap();
    assert_eq!(plan.relation(), AlignmentRelation::RequiresResample);
    for grid in [&t, &g] {
        assert_eq!((grid.width(), grid.height()), (100, 100));
        assert_eq!(grid.geometry().pixel_width, 1.0);
    }
    let height = difference(&t, &g, &QualityThresholds::default()).unwrap();
    assert_eq!(height.report.mean, Some(40.0));
    assert_eq!(height.report.std, Some(0.0));
    assert!(!height.report.implausible);
}

#[test]
fn test_fill_never_changes_valid_pixels() {
    for seed in 0..8 {
        let grid = noisy_grid(23, 17, seed, 0.4);
        for options in [
            FillOptions::default(),
            FillOptions {
                max_distance: 0,
                smoothing_iterations: 3,
            },
            FillOptions {
                max_distance: 2,
                smoothing_iterations: 5,
            },
        ] {
            let filled = fill(&grid, &options).unwrap();
            assert_eq!(filled.grid.geometry(), grid.geometry());
            assert_eq!(filled.grid.len(), grid.len());
            assert_eq!(filled.filled + filled.remaining, grid.nodata_count());
            for (before, after) in grid.data().iter().zip(filled.grid.data()) {
                if *before != NODATA {
                    assert_eq!(before, after);
                }
            }
        }
    }
}

#[test]
fn test_difference_is_antisymmetric() {
    let a = noisy_grid(12, 9, 1, 0.2);
    let b = noisy_grid(12, 9, 2, 0.2);
    let thresholds = QualityThresholds::default();
    let ab = difference(&a, &b, &thresholds).unwrap();
    let ba = difference(&b, &a, &thresholds).unwrap();
    for (x, y) in ab.grid.data().iter().zip(ba.grid.data()) {
        if *x == NODATA {
            assert_eq!(*y, NODATA);
        } else {
            assert_eq!(*x, -*y);
        }
    }
}

#[test]
fn test_align_identity_and_crop_laws() {
    let options = AlignOptions::default();
    for seed in 0..4 {
        let top = noisy_grid(30, 20, seed, 0.1);
        let ground = noisy_grid(30, 20, seed + 100, 0.1);
        let (plan, t, g) = align(&top, &ground, &options).unwrap();
        assert_eq!(plan, AlignmentPlan::Identical);
        assert_eq!(t, top);
        assert_eq!(g, ground);

        let window = CropWindow {
            col_off: 3 + seed as usize,
            row_off: 2,
            width: 11,
            height: 7,
        };
        let subset = ground.crop(&window).unwrap();
        let (plan, t, g) = align(&top, &subset, &options).unwrap();
        assert_eq!(plan.relation(), AlignmentRelation::SubsetCrop);
        assert_eq!((t.width(), t.height()), (subset.width(), subset.height()));
        assert_eq!(t, top.crop(&window).unwrap());
        assert_eq!(g, subset);
    }
}
