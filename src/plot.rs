//! 結果のグラフ（PNG）。暗い背景にネオン色の線を光らせて描きます。

use crate::IMAGES_DIR;
use crate::dataset::ReferenceDataset;
use crate::training::{EpochSummary, TrainingReport};
use plotters::prelude::*;
use std::error::Error;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

const SIZE: (u32, u32) = (1024, 768);
const BACKGROUND: RGBColor = RGBColor(0x21, 0x29, 0x46);
const GRID: RGBColor = RGBColor(0x2A, 0x34, 0x59);
const TEXT: RGBColor = RGBColor(0xE6, 0xE6, 0xE6);
static PALETTE: [RGBColor; 4] = [
    RGBColor(0x08, 0xF7, 0xFE),
    RGBColor(0xFE, 0x53, 0xBB),
    RGBColor(0xF5, 0xD3, 0x00),
    RGBColor(0x00, 0xFF, 0x41),
];
/// 線の周りに重ねる半透明の太線の数
const GLOW_LAYERS: u32 = 10;
const LINE_WIDTH: u32 = 2;

/// 凡例付きの1本の線。
struct Curve<'a> {
    label: &'a str,
    points: Vec<(f64, f64)>,
}

/// 画像の保存先ディレクトリを作って返します。
pub fn images_dir() -> std::io::Result<PathBuf> {
    let dir = PathBuf::from(IMAGES_DIR);
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// 参照解 `y(x)` を描画します。
pub fn plot_trajectory(path: &Path, dataset: &ReferenceDataset) -> Result<(), Box<dyn Error>> {
    let numerical = Curve {
        label: "The numerical method",
        points: dataset.x().iter().copied().zip(dataset.y().iter().copied()).collect(),
    };
    draw(path, "Dependence of y on x", "x-axis", "y-axis", &[numerical])
}

/// 参照解と PINN の予測を重ねて描画します。
pub fn plot_comparison(
    path: &Path,
    dataset: &ReferenceDataset,
    prediction: &[f32],
) -> Result<(), Box<dyn Error>> {
    let numerical = Curve {
        label: "The numerical method",
        points: dataset.x().iter().copied().zip(dataset.y().iter().copied()).collect(),
    };
    let pinn = Curve {
        label: "PINN",
        points: dataset
            .x()
            .iter()
            .zip(prediction)
            .map(|(&x, &y)| (x, y as f64))
            .collect(),
    };
    draw(
        path,
        "Dependence of y on x",
        "x-axis",
        "y-axis",
        &[numerical, pinn],
    )
}

/// エポックごとの損失を対数スケールで描画します。有限でない値は飛ばします。
pub fn plot_loss_history(path: &Path, report: &TrainingReport) -> Result<(), Box<dyn Error>> {
    let log_points = |value: fn(&EpochSummary) -> f64| {
        report
            .epochs
            .iter()
            .map(|epoch| (epoch.epoch as f64, value(epoch)))
            .filter(|(_, loss)| loss.is_finite() && *loss > 0.0)
            .map(|(epoch, loss)| (epoch, loss.log10()))
            .collect::<Vec<_>>()
    };
    let curves = [
        Curve {
            label: "Total Loss",
            points: log_points(|epoch| epoch.metrics.loss),
        },
        Curve {
            label: "Equation Loss",
            points: log_points(|epoch| epoch.metrics.equation),
        },
        Curve {
            label: "Boundary Loss",
            points: log_points(|epoch| epoch.metrics.boundary),
        },
    ];
    draw(path, "Loss History", "Epochs", "Loss (log10 scale)", &curves)
}

fn draw(
    path: &Path,
    title: &str,
    x_desc: &str,
    y_desc: &str,
    curves: &[Curve<'_>],
) -> Result<(), Box<dyn Error>> {
    let (x_range, y_range) = ranges(curves.iter().flat_map(|curve| curve.points.iter().copied()))
        .ok_or("描画できる点がありません")?;

    let root = BitMapBackend::new(path, SIZE).into_drawing_area();
    root.fill(&BACKGROUND)?;
    let mut chart = ChartBuilder::on(&root)
        .caption(
            title,
            ("sans-serif", 32)
                .into_font()
                .style(FontStyle::Bold)
                .color(&TEXT),
        )
        .margin(15)
        .x_label_area_size(45)
        .y_label_area_size(60)
        .build_cartesian_2d(x_range, y_range)?;
    chart
        .configure_mesh()
        .bold_line_style(&GRID)
        .light_line_style(&BACKGROUND)
        .axis_style(&GRID)
        .label_style(("sans-serif", 16).into_font().color(&TEXT))
        .x_desc(x_desc)
        .y_desc(y_desc)
        .draw()?;

    for (curve, &color) in curves.iter().zip(PALETTE.iter().cycle()) {
        for layer in 1..=GLOW_LAYERS {
            chart.draw_series(LineSeries::new(
                curve.points.iter().copied(),
                color
                    .mix(0.3 / GLOW_LAYERS as f64)
                    .stroke_width(LINE_WIDTH + layer),
            ))?;
        }
        chart
            .draw_series(LineSeries::new(
                curve.points.iter().copied(),
                color.stroke_width(LINE_WIDTH),
            ))?
            .label(curve.label)
            .legend(move |(x, y)| {
                PathElement::new(vec![(x, y), (x + 20, y)], color.stroke_width(LINE_WIDTH))
            });
    }

    chart
        .configure_series_labels()
        .position(SeriesLabelPosition::LowerRight)
        .label_font(("sans-serif", 16).into_font().color(&TEXT))
        .background_style(&BACKGROUND.mix(0.8))
        .border_style(&GRID)
        .draw()?;
    root.present()?;
    Ok(())
}

/// 有限な点をすべて含み、上下左右に 5% の余白を持つ描画範囲。
fn ranges(points: impl Iterator<Item = (f64, f64)>) -> Option<(Range<f64>, Range<f64>)> {
    let mut bounds: Option<[f64; 4]> = None;
    for (x, y) in points.filter(|(x, y)| x.is_finite() && y.is_finite()) {
        let b = bounds.get_or_insert([x, x, y, y]);
        b[0] = b[0].min(x);
        b[1] = b[1].max(x);
        b[2] = b[2].min(y);
        b[3] = b[3].max(y);
    }
    let [x_min, x_max, y_min, y_max] = bounds?;
    Some((padded(x_min, x_max), padded(y_min, y_max)))
}

fn padded(min: f64, max: f64) -> Range<f64> {
    let span = max - min;
    if span == 0.0 {
        let half = if min == 0.0 { 1.0 } else { min.abs() * 0.5 };
        return (min - half)..(max + half);
    }
    (min - 0.05 * span)..(max + 0.05 * span)
}
