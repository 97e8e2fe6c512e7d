//! Visualization path: result rows in, artifact reference out
//!
//! The stage only decides what to draw (chart kind and axes). Drawing
//! is delegated to a [`ChartRenderer`]; the default [`JsonChartRenderer`]
//! writes a chart description per session that any front end can plot.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{RenderError, StageError};
use crate::types::{ResultSet, SessionId};

/// Chart kinds the renderer understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartKind {
    Bar,
    Line,
    Histogram,
    Pie,
    Scatter,
    Box,
    Heatmap,
}

impl ChartKind {
    pub const ALL: [ChartKind; 7] = [
        ChartKind::Bar,
        ChartKind::Line,
        ChartKind::Histogram,
        ChartKind::Pie,
        ChartKind::Scatter,
        ChartKind::Box,
        ChartKind::Heatmap,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChartKind::Bar => "bar",
            ChartKind::Line => "line",
            ChartKind::Histogram => "histogram",
            ChartKind::Pie => "pie",
            ChartKind::Scatter => "scatter",
            ChartKind::Box => "box",
            ChartKind::Heatmap => "heatmap",
        }
    }
}

impl fmt::Display for ChartKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Chart kinds people ask for that are not drawn
pub const UNSUPPORTED_CHARTS: &[&str] = &[
    "area", "bubble", "treemap", "radar", "sunburst", "waterfall", "funnel", "sankey", "violin",
    "donut", "candlestick", "gantt",
];

lazy_static! {
    static ref KIND_WORD: Regex = Regex::new(
        r"(?i)\b(bar|line|histogram|pie|scatter|box\s?plot|box|heat\s?map|area|bubble|treemap|radar|sunburst|waterfall|funnel|sankey|violin|donut|candlestick|gantt)\b"
    )
    .unwrap();
}

/// Chart kind named in a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChartRequest {
    Kind(ChartKind),
    Unsupported(String),
    Unspecified,
}

pub fn requested_chart(text: &str) -> ChartRequest {
    let Some(m) = KIND_WORD.find(text) else {
        return ChartRequest::Unspecified;
    };
    let word: String = m
        .as_str()
        .to_ascii_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();

    match word.as_str() {
        "bar" => ChartRequest::Kind(ChartKind::Bar),
        "line" => ChartRequest::Kind(ChartKind::Line),
        "histogram" => ChartRequest::Kind(ChartKind::Histogram),
        "pie" => ChartRequest::Kind(ChartKind::Pie),
        "scatter" => ChartRequest::Kind(ChartKind::Scatter),
        "box" | "boxplot" => ChartRequest::Kind(ChartKind::Box),
        "heatmap" => ChartRequest::Kind(ChartKind::Heatmap),
        other => ChartRequest::Unsupported(other.to_string()),
    }
}

/// What to draw
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartSpec {
    pub kind: ChartKind,
    pub title: String,
    pub x: Option<String>,
    pub y: Option<String>,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

/// Where a rendered chart ended up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub kind: ChartKind,
    pub location: String,
}

pub trait ChartRenderer: Send + Sync {
    fn render(&self, session_id: &SessionId, spec: &ChartSpec) -> Result<ArtifactRef, RenderError>;

    /// Remove every artifact of a session
    fn cleanup(&self, session_id: &SessionId) -> Result<(), RenderError>;
}

/// Writes `<output_dir>/<session>/<uuid>.json` chart descriptions
pub struct JsonChartRenderer {
    output_dir: PathBuf,
}

impl JsonChartRenderer {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    fn session_dir(&self, session_id: &SessionId) -> PathBuf {
        let name: String = session_id
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.output_dir.join(name)
    }
}

impl ChartRenderer for JsonChartRenderer {
    fn render(&self, session_id: &SessionId, spec: &ChartSpec) -> Result<ArtifactRef, RenderError> {
        let dir = self.session_dir(session_id);
        std::fs::create_dir_all(&dir).map_err(|e| RenderError::Output(e.to_string()))?;

        let path = dir.join(format!("{}-{}.json", spec.kind, Uuid::new_v4()));
        let body = serde_json::to_string_pretty(spec).map_err(|e| RenderError::Output(e.to_string()))?;
        std::fs::write(&path, body).map_err(|e| RenderError::Output(e.to_string()))?;

        Ok(ArtifactRef {
            kind: spec.kind,
            location: path.display().to_string(),
        })
    }

    fn cleanup(&self, session_id: &SessionId) -> Result<(), RenderError> {
        let dir = self.session_dir(session_id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RenderError::Output(e.to_string())),
        }
    }
}

pub struct Visualizer {
    renderer: Arc<dyn ChartRenderer>,
}

impl Visualizer {
    pub fn new(renderer: Arc<dyn ChartRenderer>) -> Self {
        Self { renderer }
    }

    /// Pick kind and axes for `result`, then render it
    pub fn visualize(
        &self,
        session_id: &SessionId,
        title: &str,
        result: &ResultSet,
        requested: Option<ChartKind>,
    ) -> Result<ArtifactRef, StageError> {
        let spec = chart_spec(title, result, requested)?;
        tracing::debug!(kind = %spec.kind, x = ?spec.x, y = ?spec.y, "Rendering chart");
        Ok(self.renderer.render(session_id, &spec)?)
    }

    pub fn cleanup(&self, session_id: &SessionId) -> Result<(), RenderError> {
        self.renderer.cleanup(session_id)
    }
}

fn is_numeric_column(result: &ResultSet, index: usize) -> bool {
    let mut seen = false;
    for row in &result.rows {
        match row.get(index) {
            Some(Value::Number(_)) => seen = true,
            Some(Value::Null) | None => {}
            Some(_) => return false,
        }
    }
    seen
}

/// Decide the chart kind and axes for a result set
pub fn chart_spec(title: &str, result: &ResultSet, requested: Option<ChartKind>) -> Result<ChartSpec, RenderError> {
    if result.is_empty() {
        return Err(RenderError::NoData);
    }

    let (numeric, categorical): (Vec<usize>, Vec<usize>) =
        (0..result.columns.len()).partition(|&i| is_numeric_column(result, i));
    let name = |i: usize| result.columns[i].clone();

    let kind = match requested {
        Some(kind) => kind,
        None => match (categorical.len(), numeric.len()) {
            (_, 0) => {
                return Err(RenderError::Unchartable(
                    "the result has no numeric column".to_string(),
                ))
            }
            (c, _) if c > 0 => ChartKind::Bar,
            (_, n) if n >= 2 => ChartKind::Scatter,
            _ => ChartKind::Histogram,
        },
    };

    let (x, y) = match kind {
        ChartKind::Histogram | ChartKind::Box => (None, numeric.first().copied()),
        ChartKind::Scatter => {
            if numeric.len() < 2 {
                return Err(RenderError::Unchartable(
                    "a scatter chart needs two numeric columns".to_string(),
                ));
            }
            (Some(numeric[0]), Some(numeric[1]))
        }
        ChartKind::Heatmap => {
            let x = categorical.first().copied();
            let y = categorical.get(1).copied().or_else(|| numeric.first().copied());
            (x, y)
        }
        ChartKind::Bar | ChartKind::Line | ChartKind::Pie => {
            let x = categorical.first().copied().or_else(|| numeric.first().copied());
            let y = numeric.iter().copied().find(|i| Some(*i) != x);
            (x, y)
        }
    };

    if y.is_none() {
        return Err(RenderError::Unchartable(format!(
            "a {} chart needs a numeric column",
            kind
        )));
    }

    Ok(ChartSpec {
        kind,
        title: title.to_string(),
        x: x.map(name),
        y: y.map(name),
        columns: result.columns.clone(),
        rows: result.rows.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn by_region() -> ResultSet {
        ResultSet {
            columns: vec!["region".into(), "total".into()],
            rows: vec![vec![json!("north"), json!(12.5)], vec![json!("south"), json!(7)]],
        }
    }

    #[test]
    fn test_requested_chart_words() {
        assert_eq!(requested_chart("draw a pie chart of sales"), ChartRequest::Kind(ChartKind::Pie));
        assert_eq!(requested_chart("a Box plot of price"), ChartRequest::Kind(ChartKind::Box));
        assert_eq!(requested_chart("heat map please"), ChartRequest::Kind(ChartKind::Heatmap));
        assert_eq!(
            requested_chart("an area chart of revenue"),
            ChartRequest::Unsupported("area".into())
        );
        assert_eq!(requested_chart("plot price"), ChartRequest::Unspecified);
    }

    #[test]
    fn test_kind_inferred_from_shape() {
        assert_eq!(chart_spec("t", &by_region(), None).unwrap().kind, ChartKind::Bar);

        let pairs = ResultSet {
            columns: vec!["price".into(), "qty".into()],
            rows: vec![vec![json!(1.0), json!(3)]],
        };
        let spec = chart_spec("t", &pairs, None).unwrap();
        assert_eq!(spec.kind, ChartKind::Scatter);
        assert_eq!(spec.x.as_deref(), Some("price"));
        assert_eq!(spec.y.as_deref(), Some("qty"));

        let single = ResultSet {
            columns: vec!["price".into()],
            rows: vec![vec![json!(1.0)], vec![json!(null)]],
        };
        assert_eq!(chart_spec("t", &single, None).unwrap().kind, ChartKind::Histogram);
    }

    #[test]
    fn test_unchartable_results() {
        assert_eq!(chart_spec("t", &ResultSet::default(), None), Err(RenderError::NoData));

        let text_only = ResultSet {
            columns: vec!["name".into()],
            rows: vec![vec![json!("pen")]],
        };
        assert!(matches!(chart_spec("t", &text_only, None), Err(RenderError::Unchartable(_))));
        assert!(matches!(
            chart_spec("t", &by_region(), Some(ChartKind::Scatter)),
            Err(RenderError::Unchartable(_))
        ));
    }

    #[test]
    fn test_json_renderer_writes_and_cleans_per_session() {
        let dir = TempDir::new().unwrap();
        let visualizer = Visualizer::new(Arc::new(JsonChartRenderer::new(dir.path())));
        let a = SessionId::from("session:a");
        let b = SessionId::from("session:b");

        let artifact = visualizer.visualize(&a, "totals", &by_region(), None).unwrap();
        visualizer.visualize(&b, "totals", &by_region(), Some(ChartKind::Pie)).unwrap();
        assert_eq!(artifact.kind, ChartKind::Bar);

        let written: ChartSpec =
            serde_json::from_str(&std::fs::read_to_string(&artifact.location).unwrap()).unwrap();
        assert_eq!(written.x.as_deref(), Some("region"));
        assert_eq!(written.y.as_deref(), Some("total"));

        visualizer.cleanup(&a).unwrap();
        assert!(!std::path::Path::new(&artifact.location).exists());
        assert!(dir.path().join("session_b").exists());
        visualizer.cleanup(&a).unwrap();
    }
}
