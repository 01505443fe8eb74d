//! Diagnostic SVG charts: training curves and the modality-weight histogram.
//!
//! Plain SVG strings, so no plotting backend or font setup is required.

use std::fmt::Write as _;
use std::path::Path;

use anyhow::Context;

const CHART_WIDTH: f64 = 800.0;
const CHART_HEIGHT: f64 = 400.0;
const MARGIN_TOP: f64 = 50.0;
const MARGIN_RIGHT: f64 = 40.0;
const MARGIN_BOTTOM: f64 = 60.0;
const MARGIN_LEFT: f64 = 70.0;
const GRID_LINES: usize = 5;

pub const COLOR_TRAIN: &str = "#3498db";
pub const COLOR_VAL: &str = "#e74c3c";
const COLOR_BAR: &str = "#2ecc71";
const COLOR_GRID: &str = "#ecf0f1";
const COLOR_AXIS: &str = "#2c3e50";

/// One line on a chart; x is the 1-based index of each value.
#[derive(Debug, Clone)]
pub struct Series<'a> {
    pub name: &'a str,
    pub values: &'a [f64],
    pub color: &'a str,
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn plot_width() -> f64 {
    CHART_WIDTH - MARGIN_LEFT - MARGIN_RIGHT
}

fn plot_height() -> f64 {
    CHART_HEIGHT - MARGIN_TOP - MARGIN_BOTTOM
}

/// Padded `[min, max]` that never collapses to a point.
fn value_range(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let (lo, hi) = values
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        });
    if !lo.is_finite() {
        return (0.0, 1.0);
    }
    if (hi - lo).abs() < 1e-12 {
        return (lo - 0.5, hi + 0.5);
    }
    let pad = (hi - lo) * 0.05;
    (lo - pad, hi + pad)
}

fn open_svg(svg: &mut String, title: &str, x_label: &str, y_label: &str) {
    let _ = write!(
        svg,
        r#"<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 {w} {h}" width="{w}" height="{h}">"#,
        w = CHART_WIDTH,
        h = CHART_HEIGHT
    );
    let _ = write!(
        svg,
        r#"<rect width="{}" height="{}" fill="white"/>"#,
        CHART_WIDTH, CHART_HEIGHT
    );
    let _ = write!(
        svg,
        r#"<text x="{}" y="30" text-anchor="middle" font-family="sans-serif" font-size="18" font-weight="bold" fill="{}">{}</text>"#,
        CHART_WIDTH / 2.0,
        COLOR_AXIS,
        escape_xml(title)
    );
    let _ = write!(
        svg,
        r#"<text x="{}" y="{}" text-anchor="middle" font-family="sans-serif" font-size="14" fill="{}">{}</text>"#,
        MARGIN_LEFT + plot_width() / 2.0,
        CHART_HEIGHT - 15.0,
        COLOR_AXIS,
        escape_xml(x_label)
    );
    let _ = write!(
        svg,
        r#"<text x="18" y="{y}" text-anchor="middle" font-family="sans-serif" font-size="14" fill="{}" transform="rotate(-90 18 {y})">{}</text>"#,
        COLOR_AXIS,
        escape_xml(y_label),
        y = CHART_HEIGHT / 2.0
    );
}

fn grid_and_axes(svg: &mut String, y_min: f64, y_max: f64) {
    let (pw, ph) = (plot_width(), plot_height());
    for i in 0..=GRID_LINES {
        let frac = i as f64 / GRID_LINES as f64;
        let y = MARGIN_TOP + ph - frac * ph;
        let value = y_min + frac * (y_max - y_min);
        let _ = write!(
            svg,
            r#"<line x1="{}" y1="{y}" x2="{}" y2="{y}" stroke="{}" stroke-width="1"/>"#,
            MARGIN_LEFT,
            MARGIN_LEFT + pw,
            COLOR_GRID
        );
        let _ = write!(
            svg,
            r#"<text x="{}" y="{}" text-anchor="end" font-family="sans-serif" font-size="11" fill="{}">{value:.3}</text>"#,
            MARGIN_LEFT - 8.0,
            y + 4.0,
            COLOR_AXIS
        );
    }
    let _ = write!(
        svg,
        r#"<line x1="{l}" y1="{b}" x2="{r}" y2="{b}" stroke="{c}" stroke-width="2"/><line x1="{l}" y1="{t}" x2="{l}" y2="{b}" stroke="{c}" stroke-width="2"/>"#,
        l = MARGIN_LEFT,
        r = MARGIN_LEFT + pw,
        t = MARGIN_TOP,
        b = MARGIN_TOP + ph,
        c = COLOR_AXIS
    );
}

/// Render a multi-series line chart.
pub fn line_chart_svg(title: &str, x_label: &str, y_label: &str, series: &[Series<'_>]) -> String {
    let (pw, ph) = (plot_width(), plot_height());
    let (y_min, y_max) = value_range(series.iter().flat_map(|s| s.values.iter().copied()));
    let n_max = series.iter().map(|s| s.values.len()).max().unwrap_or(0);
    let x_span = (n_max.max(2) - 1) as f64;

    let mut svg = String::new();
    open_svg(&mut svg, title, x_label, y_label);
    grid_and_axes(&mut svg, y_min, y_max);

    let to_xy = |i: usize, v: f64| {
        let x = MARGIN_LEFT + (i as f64 / x_span) * pw;
        let y = MARGIN_TOP + ph - ((v - y_min) / (y_max - y_min)) * ph;
        (x, y)
    };

    for i in 0..n_max {
        let (x, _) = to_xy(i, y_min);
        let _ = write!(
            svg,
            r#"<text x="{x}" y="{}" text-anchor="middle" font-family="sans-serif" font-size="11" fill="{}">{}</text>"#,
            MARGIN_TOP + ph + 18.0,
            COLOR_AXIS,
            i + 1
        );
    }

    for (k, s) in series.iter().enumerate() {
        if s.values.is_empty() {
            continue;
        }
        let mut path = String::new();
        for (i, &v) in s.values.iter().enumerate() {
            let (x, y) = to_xy(i, v);
            let _ = write!(path, "{}{x:.2} {y:.2}", if i == 0 { "M " } else { " L " });
        }
        let _ = write!(
            svg,
            r#"<path d="{path}" fill="none" stroke="{}" stroke-width="2.5"/>"#,
            s.color
        );
        for (i, &v) in s.values.iter().enumerate() {
            let (x, y) = to_xy(i, v);
            let _ = write!(
                svg,
                r#"<circle cx="{x:.2}" cy="{y:.2}" r="3.5" fill="{}"/>"#,
                s.color
            );
        }
        let legend_y = MARGIN_TOP + 10.0 + 22.0 * k as f64;
        let legend_x = CHART_WIDTH - MARGIN_RIGHT - 140.0;
        let _ = write!(
            svg,
            r#"<rect x="{legend_x}" y="{legend_y}" width="14" height="14" fill="{}"/><text x="{}" y="{}" font-family="sans-serif" font-size="12" fill="{}">{}</text>"#,
            s.color,
            legend_x + 20.0,
            legend_y + 12.0,
            COLOR_AXIS,
            escape_xml(s.name)
        );
    }

    svg.push_str("</svg>");
    svg
}

/// Equal-width bin counts over `[min, max]` of the finite values.
pub fn histogram_bins(values: &[f32], bins: usize) -> (f64, f64, Vec<usize>) {
    let finite: Vec<f64> = values
        .iter()
        .map(|&v| v as f64)
        .filter(|v| v.is_finite())
        .collect();
    let bins = bins.max(1);
    if finite.is_empty() {
        return (0.0, 1.0, vec![0; bins]);
    }
    let lo = finite.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = finite.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let (lo, hi) = if hi - lo < 1e-12 {
        (lo - 0.5, hi + 0.5)
    } else {
        (lo, hi)
    };
    let width = (hi - lo) / bins as f64;
    let mut counts = vec![0usize; bins];
    for v in finite {
        let idx = (((v - lo) / width) as usize).min(bins - 1);
        counts[idx] += 1;
    }
    (lo, hi, counts)
}

/// Render a histogram of `values`.
pub fn histogram_svg(title: &str, x_label: &str, values: &[f32], bins: usize) -> String {
    let (pw, ph) = (plot_width(), plot_height());
    let (lo, hi, counts) = histogram_bins(values, bins);
    let max_count = counts.iter().copied().max().unwrap_or(0).max(1) as f64;

    let mut svg = String::new();
    open_svg(&mut svg, title, x_label, "Frequency");
    grid_and_axes(&mut svg, 0.0, max_count);

    let bar_w = pw / counts.len() as f64;
    for (i, &c) in counts.iter().enumerate() {
        let h = c as f64 / max_count * ph;
        let x = MARGIN_LEFT + i as f64 * bar_w;
        let y = MARGIN_TOP + ph - h;
        let _ = write!(
            svg,
            r#"<rect x="{x:.2}" y="{y:.2}" width="{:.2}" height="{h:.2}" fill="{}" fill-opacity="0.7" stroke="white"/>"#,
            (bar_w - 1.0).max(0.5),
            COLOR_BAR
        );
    }
    for (frac, value) in [(0.0, lo), (0.5, (lo + hi) / 2.0), (1.0, hi)] {
        let _ = write!(
            svg,
            r#"<text x="{:.2}" y="{}" text-anchor="middle" font-family="sans-serif" font-size="11" fill="{}">{value:.3}</text>"#,
            MARGIN_LEFT + frac * pw,
            MARGIN_TOP + ph + 18.0,
            COLOR_AXIS
        );
    }

    svg.push_str("</svg>");
    svg
}

/// Write an SVG document, creating parent directories.
pub fn write_svg(path: &Path, svg: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create plot dir {}", parent.display()))?;
    }
    std::fs::write(path, svg).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
