//! HTML chart of a stored training dataset.

use askama::Template;

use crate::error::{Error, Result};
use crate::series::TrainingDataset;
use crate::storage::ModelVersionRecord;

const WIDTH: f64 = 800.0;
const HEIGHT: f64 = 300.0;
const PAD: f64 = 20.0;

struct Row {
    timestamp: i64,
    value: f64,
}

#[derive(Template)]
#[template(
    ext = "html",
    source = r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>{{ series_id }} v{{ version }}</title></head>
<body>
<h1>{{ series_id }} &middot; version {{ version }}</h1>
<p>{{ rows.len() }} points, trained {{ created_at }}</p>
<svg xmlns="http://www.w3.org/2000/svg" width="{{ width }}" height="{{ height }}" viewBox="0 0 {{ width }} {{ height }}">
  <polyline fill="none" stroke="steelblue" stroke-width="2" points="{{ points }}"/>
</svg>
<table>
<tr><th>timestamp</th><th>value</th></tr>
{% for row in rows %}<tr><td>{{ row.timestamp }}</td><td>{{ row.value }}</td></tr>
{% endfor %}</table>
</body>
</html>"#
)]
struct PlotPage<'a> {
    series_id: &'a str,
    version: u32,
    created_at: String,
    width: f64,
    height: f64,
    points: String,
    rows: Vec<Row>,
}

pub fn render(record: &ModelVersionRecord, dataset: &TrainingDataset) -> Result<String> {
    let page = PlotPage {
        series_id: &record.series_id,
        version: record.version,
        created_at: record.created_at.to_rfc3339(),
        width: WIDTH,
        height: HEIGHT,
        points: polyline(dataset, WIDTH, HEIGHT),
        rows: dataset
            .points()
            .iter()
            .map(|p| Row {
                timestamp: p.timestamp,
                value: p.value,
            })
            .collect(),
    };
    page.render()
        .map_err(|e| Error::Storage(format!("failed to render plot: {e}")))
}

/// SVG `points` attribute scaled into a `width` x `height` box.
fn polyline(dataset: &TrainingDataset, width: f64, height: f64) -> String {
    let pts = dataset.points();
    let (t0, t1) = (pts[0].timestamp as f64, pts[pts.len() - 1].timestamp as f64);
    let (lo, hi) = dataset
        .values()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    let span_t = (t1 - t0).max(1.0);
    let span_v = if hi > lo { hi - lo } else { 1.0 };

    pts.iter()
        .map(|p| {
            let x = PAD + (p.timestamp as f64 - t0) / span_t * (width - 2.0 * PAD);
            let y = height - PAD - (p.value - lo) / span_v * (height - 2.0 * PAD);
            format!("{x:.1},{y:.1}")
        })
        .collect::<Vec<_>>()
        .join(" ")
}
