//! Emotion charts.
use std::path::{Path, PathBuf};

use plotters::coord::ranged1d::SegmentValue;
use plotters::drawing::DrawingAreaErrorKind;
use plotters::prelude::*;
use plotters::style::text_anchor::{HPos, Pos, VPos};
use snafu::{ResultExt, Snafu};

use crate::sentiment::Emotion;

type DrawError = DrawingAreaErrorKind<std::io::Error>;

const BAR_COLOR: RGBColor = RGBColor(106, 90, 205);

const FONT: &str = "sans-serif";

#[derive(Debug, Snafu)]
pub enum PlotError {
    #[snafu(display("Cannot draw chart: {}", path.to_string_lossy()))]
    Draw { path: PathBuf, source: DrawError },
}

/// Emotion of an utterance at a point in time.
#[derive(Clone, Debug, PartialEq)]
pub struct TrajectoryPoint {
    /// Time of the utterance, formatted as `HH:MM:SS`.
    pub time: String,
    pub emotion: Emotion,
}

/// Draw a bar chart of the emotion probabilities of a sentence.
pub fn plot_probabilities(
    path: impl AsRef<Path>,
    sentence: &str,
    probabilities: &[f32; 7],
) -> Result<(), PlotError> {
    let path = path.as_ref();
    draw_probabilities(path, sentence, probabilities).context(DrawSnafu { path })
}

fn draw_probabilities(
    path: &Path,
    sentence: &str,
    probabilities: &[f32; 7],
) -> Result<(), DrawError> {
    let root = SVGBackend::new(path, (800, 600)).into_drawing_area();
    root.fill(&WHITE)?;

    let n_emotions = Emotion::ALL.len();
    let mut chart = ChartBuilder::on(&root)
        .caption(format!("문장: {sentence}"), (FONT, 24))
        .margin(20)
        .x_label_area_size(40)
        .y_label_area_size(50)
        .build_cartesian_2d((0..n_emotions - 1).into_segmented(), 0f32..1.1f32)?;

    chart
        .configure_mesh()
        .disable_x_mesh()
        .x_labels(n_emotions)
        .x_label_formatter(&|value| match value {
            SegmentValue::CenterOf(index) => Emotion::from_index(*index)
                .map(|emotion| emotion.label().to_string())
                .unwrap_or_default(),
            _ => String::new(),
        })
        .draw()?;

    chart
        .draw_series(
            Histogram::vertical(&chart)
                .style(BAR_COLOR.filled())
                .margin(10)
                .data(probabilities.iter().copied().enumerate()),
        )?
        .label("감정")
        .legend(|(x, y)| Rectangle::new([(x, y - 5), (x + 10, y + 5)], BAR_COLOR.filled()));

    let value_style =
        TextStyle::from((FONT, 14).into_font()).pos(Pos::new(HPos::Center, VPos::Bottom));
    chart.draw_series(probabilities.iter().enumerate().map(|(index, &probability)| {
        Text::new(
            format!("{probability:.1}"),
            (SegmentValue::CenterOf(index), probability),
            value_style.clone(),
        )
    }))?;

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()?;

    root.present()
}

/// Draw a line chart of the emotions of a conversation over time.
pub fn plot_trajectory(
    path: impl AsRef<Path>,
    points: &[TrajectoryPoint],
) -> Result<(), PlotError> {
    let path = path.as_ref();
    draw_trajectory(path, points).context(DrawSnafu { path })
}

/// Get the element of `items` at an integral coordinate.
fn at_integral<T>(items: &[T], coord: f64) -> Option<&T> {
    let index = coord.round();
    if (coord - index).abs() > 1e-6 || index < 0. {
        return None;
    }
    items.get(index as usize)
}

fn draw_trajectory(path: &Path, points: &[TrajectoryPoint]) -> Result<(), DrawError> {
    let root = SVGBackend::new(path, (1200, 800)).into_drawing_area();
    root.fill(&WHITE)?;

    let max_x = points.len().saturating_sub(1).max(1) as f64;
    let max_y = (Emotion::ALL.len() - 1) as f64;
    let mut chart = ChartBuilder::on(&root)
        .margin(30)
        .x_label_area_size(60)
        .y_label_area_size(80)
        .build_cartesian_2d(-0.1f64..max_x + 0.1, -0.2f64..max_y + 0.2)?;

    let times = points.iter().map(|point| point.time.as_str()).collect::<Vec<_>>();
    chart
        .configure_mesh()
        .x_labels(points.len().max(2))
        .y_labels(Emotion::ALL.len())
        .x_label_formatter(&|&x| {
            at_integral(&times, x)
                .map(|time| time.to_string())
                .unwrap_or_default()
        })
        .y_label_formatter(&|&y| {
            at_integral(&Emotion::ALL, y)
                .map(|emotion| emotion.label().to_string())
                .unwrap_or_default()
        })
        .x_desc("시간")
        .y_desc("감정 각성도")
        .axis_desc_style((FONT, 16))
        .draw()?;

    let coords = points
        .iter()
        .enumerate()
        .map(|(x, point)| (x as f64, point.emotion.index() as f64))
        .collect::<Vec<_>>();
    chart.draw_series(LineSeries::new(coords.iter().copied(), RED.stroke_width(2)))?;
    chart.draw_series(points.iter().zip(&coords).map(|(point, &(x, y))| {
        Text::new(point.emotion.label(), (x + 0.05, y), (FONT, 12).into_font())
    }))?;

    root.present()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use rstest::rstest;

    use super::{at_integral, plot_probabilities, plot_trajectory, TrajectoryPoint};
    use crate::sentiment::Emotion;

    #[test]
    fn writes_probability_chart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("emotion_0.svg");
        plot_probabilities(
            &path,
            "오늘 날씨 좋아요",
            &[0.05, 0.1, 0.7, 0.05, 0.04, 0.03, 0.03],
        )
        .unwrap();

        let svg = fs::read_to_string(&path).unwrap();
        assert!(svg.contains("<svg"));
        assert!(svg.contains("문장: 오늘 날씨 좋아요"));
        assert!(svg.contains("0.7"));
        assert!(svg.contains("행복"));
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(3)]
    fn writes_trajectory_chart(#[case] n_points: usize) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trajectory.svg");
        let points = (0..n_points)
            .map(|i| TrajectoryPoint {
                time: format!("12:00:0{i}"),
                emotion: Emotion::ALL[i % Emotion::ALL.len()],
            })
            .collect::<Vec<_>>();
        plot_trajectory(&path, &points).unwrap();

        let svg = fs::read_to_string(&path).unwrap();
        assert!(svg.contains("감정 각성도"));
        for point in &points {
            assert!(svg.contains(&point.time));
        }
    }

    #[test]
    fn unwritable_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("chart.svg");
        assert!(plot_probabilities(&path, "안녕", &[0.; 7]).is_err());
    }

    #[test]
    fn looks_up_integral_coordinates() {
        let items = ["a", "b"];
        assert_eq!(at_integral(&items, 1.0), Some(&"b"));
        assert_eq!(at_integral(&items, 0.5), None);
        assert_eq!(at_integral(&items, -1.0), None);
        assert_eq!(at_integral(&items, 2.0), None);
    }
}
