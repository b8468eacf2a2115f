use std::fs;

use deepstock::{
    config::ImageSize,
    data::{
        align::align,
        chart::{chart_file_name, ChartRasterizer},
        images::ImageLoader,
        window::WindowSeries,
    },
    util::test_util::{linear_series, series_from_fn, setup_test_tracing},
};
use ndarray::{Array2, Axis};

#[test]
fn test_rendered_charts_line_up_with_windows() {
    let _guards = setup_test_tracing("test_rendered_charts_line_up_with_windows");
    let dir = tempfile::tempdir().unwrap();
    let series = linear_series(25, 10.0, 0.5);
    let w = 5;

    let paths = ChartRasterizer::new(ImageSize::new(12, 24), w)
        .render_all(&series, dir.path())
        .unwrap();
    let images = ImageLoader::new(ImageSize::new(6, 6)).load_dir(dir.path()).unwrap();
    let windows = WindowSeries::build(&series.closes(), w).unwrap();

    assert_eq!(paths.len(), 20);
    assert_eq!(images.dim(), (20, 6, 6, 3));
    assert_eq!(windows.len(), 20);
    assert!(images.iter().all(|&v| (0.0..=1.0).contains(&v)));

    let sentiments = Array2::zeros((windows.len(), 1));
    let batch = align(&images, &windows.sequences, &sentiments, &windows.targets).unwrap();
    assert_eq!(batch.len(), 20);
}

#[test]
fn test_each_image_is_the_chart_of_its_window() {
    let _guards = setup_test_tracing("test_each_image_is_the_chart_of_its_window");
    let dir = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    // Rises and falls, so neighbouring windows draw different lines.
    let series = series_from_fn(18, |i| 10.0 + (i as f64 * 0.9).sin() * 3.0 + i as f64 * 0.1);
    let closes = series.closes();
    let w = 6;

    let rasterizer = ChartRasterizer::new(ImageSize::new(16, 24), w);
    rasterizer.render_all(&series, dir.path()).unwrap();
    let loader = ImageLoader::new(ImageSize::new(8, 8));
    let images = loader.load_dir(dir.path()).unwrap();
    let windows = WindowSeries::build(&closes, w).unwrap();
    let sentiments = Array2::zeros((windows.len(), 1));
    let batch = align(&images, &windows.sequences, &sentiments, &windows.targets).unwrap();
    assert_eq!(batch.len(), 12);

    for k in 0..batch.len() {
        let path = scratch.path().join(format!("window_{}.png", k));
        rasterizer.render_window(&closes[k..k + w]).unwrap().save(&path).unwrap();
        let expected = loader.load_file(&path).unwrap();
        assert_eq!(batch.images.index_axis(Axis(0), k), expected, "image {} is not window {}", k, k);
        if k + 1 < batch.len() {
            assert_ne!(
                batch.images.index_axis(Axis(0), k + 1),
                expected,
                "windows {} and {} render the same chart",
                k,
                k + 1
            );
        }
    }
}

#[test]
fn test_corrupt_chart_shortens_the_image_modality() {
    let _guards = setup_test_tracing("test_corrupt_chart_shortens_the_image_modality");
    let dir = tempfile::tempdir().unwrap();
    let series = linear_series(15, 1.0, 1.0);
    let w = 3;

    ChartRasterizer::new(ImageSize::new(8, 8), w)
        .render_all(&series, dir.path())
        .unwrap();
    fs::write(dir.path().join(chart_file_name(7)), b"broken").unwrap();

    let images = ImageLoader::new(ImageSize::new(4, 4)).load_dir(dir.path()).unwrap();
    let windows = WindowSeries::build(&series.closes(), w).unwrap();
    assert_eq!(images.dim().0, 11);
    assert_eq!(windows.len(), 12);

    let sentiments = Array2::zeros((windows.len(), 1));
    let batch = align(&images, &windows.sequences, &sentiments, &windows.targets).unwrap();
    assert_eq!(batch.len(), 11);
}
