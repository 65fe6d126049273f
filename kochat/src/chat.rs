//! Interactive chat with emotion tracking.
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use chrono::{Duration, Utc};
use kochat_transformers::error::BoxedError;
use snafu::{ResultExt, Snafu};
use tracing::{debug, info};

use crate::generate::ChatResponder;
use crate::plot::{plot_probabilities, plot_trajectory, PlotError, TrajectoryPoint};
use crate::sentiment::{Emotion, EmotionClassifier, EmotionPrediction};

/// Utterance that ends a session.
pub const QUIT: &str = "quit";

const PROMPT: &str = "user > ";

const BOT_NAME: &str = "Simsimi";

/// Offset of Korea Standard Time from UTC in hours.
const KST_OFFSET_HOURS: i64 = 9;

#[derive(Debug, Snafu)]
pub enum ChatError {
    #[snafu(display("Cannot read utterance"))]
    ReadUtterance { source: io::Error },

    #[snafu(display("Cannot write to terminal"))]
    Write { source: io::Error },

    #[snafu(display("Cannot predict emotion of utterance"))]
    PredictEmotion { source: BoxedError },

    #[snafu(display("Cannot generate response"))]
    Respond { source: BoxedError },

    #[snafu(display("Cannot plot emotions"))]
    Plot { source: PlotError },
}

/// Generates the answer to an utterance.
pub trait Responder {
    /// Answer `utterance`, conditioned on the sentiment of the system.
    fn respond(&self, utterance: &str, sentiment: &str) -> Result<String, BoxedError>;
}

impl Responder for ChatResponder {
    fn respond(&self, utterance: &str, sentiment: &str) -> Result<String, BoxedError> {
        ChatResponder::respond(self, utterance, sentiment).boxed()
    }
}

/// Predicts the emotion of an utterance.
pub trait EmotionPredictor {
    fn predict(&self, utterance: &str) -> Result<EmotionPrediction, BoxedError>;
}

impl EmotionPredictor for EmotionClassifier {
    fn predict(&self, utterance: &str) -> Result<EmotionPrediction, BoxedError> {
        EmotionClassifier::predict(self, utterance).boxed()
    }
}

/// Current time in Korea Standard Time, formatted as `HH:MM:SS`.
pub fn kst_time() -> String {
    (Utc::now() + Duration::hours(KST_OFFSET_HOURS))
        .format("%H:%M:%S")
        .to_string()
}

/// Chat session that tracks the emotions of the user.
pub struct ChatSession<R, P> {
    plot_dir: PathBuf,
    predictor: P,
    responder: R,
    sentiment: String,
    trajectory: Vec<TrajectoryPoint>,
}

impl<R, P> ChatSession<R, P>
where
    R: Responder,
    P: EmotionPredictor,
{
    /// Create a session.
    ///
    /// Charts are written to `plot_dir`, which must exist.
    pub fn new(
        responder: R,
        predictor: P,
        sentiment: impl Into<String>,
        plot_dir: impl Into<PathBuf>,
    ) -> Self {
        ChatSession {
            plot_dir: plot_dir.into(),
            predictor,
            responder,
            sentiment: sentiment.into(),
            trajectory: Vec::new(),
        }
    }

    /// Emotions of the utterances so far.
    pub fn trajectory(&self) -> &[TrajectoryPoint] {
        &self.trajectory
    }

    /// Path of the probability chart of the `n`-th utterance.
    pub fn probabilities_path(&self, n: usize) -> PathBuf {
        self.plot_dir.join(format!("emotion_{n}.svg"))
    }

    /// Path of the emotion trajectory chart.
    pub fn trajectory_path(&self) -> PathBuf {
        self.plot_dir.join("trajectory.svg")
    }

    /// Chat until the user quits or the input ends.
    ///
    /// The emotion trajectory is plotted when the session ends, also when
    /// it ends with an error.
    pub fn run(&mut self, input: impl BufRead, mut output: impl Write) -> Result<(), ChatError> {
        let chat = self.converse(input, &mut output);

        let path = self.trajectory_path();
        let plot = plot_trajectory(&path, &self.trajectory).context(PlotSnafu);
        if plot.is_ok() {
            info!(
                path = %path.display(),
                n_utterances = self.trajectory.len(),
                "Saved emotion trajectory"
            );
        }

        chat.and(plot)
    }

    fn converse(
        &mut self,
        mut input: impl BufRead,
        output: &mut impl Write,
    ) -> Result<(), ChatError> {
        let mut line = String::new();
        loop {
            write!(output, "{PROMPT}")
                .and_then(|_| output.flush())
                .context(WriteSnafu)?;

            line.clear();
            let n_read = input.read_line(&mut line).context(ReadUtteranceSnafu)?;
            let utterance = line.trim();
            if n_read == 0 || utterance == QUIT {
                return Ok(());
            }
            if utterance.is_empty() {
                continue;
            }

            self.turn(utterance, output)?;
        }
    }

    fn turn(&mut self, utterance: &str, output: &mut impl Write) -> Result<(), ChatError> {
        let time = kst_time();
        let prediction = self
            .predictor
            .predict(utterance)
            .context(PredictEmotionSnafu)?;
        write_prediction(output, &prediction).context(WriteSnafu)?;

        let path = self.probabilities_path(self.trajectory.len());
        plot_probabilities(&path, utterance, &prediction.probabilities).context(PlotSnafu)?;
        debug!(path = %path.display(), emotion = %prediction.emotion, "Saved emotion chart");

        self.trajectory.push(TrajectoryPoint {
            time,
            emotion: prediction.emotion,
        });

        let answer = self
            .responder
            .respond(utterance, &self.sentiment)
            .context(RespondSnafu)?;
        writeln!(output, "{BOT_NAME} > {answer}").context(WriteSnafu)
    }
}

fn write_prediction(output: &mut impl Write, prediction: &EmotionPrediction) -> io::Result<()> {
    writeln!(output, "{}", prediction.emotion)?;
    let probabilities = Emotion::ALL
        .iter()
        .zip(prediction.probabilities)
        .map(|(emotion, probability)| format!("{emotion} {probability:.4}"))
        .collect::<Vec<_>>();
    writeln!(output, "[{}]", probabilities.join(", "))
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::io::Cursor;

    use kochat_transformers::error::BoxedError;
    use rstest::rstest;

    use super::{kst_time, ChatError, ChatSession, EmotionPredictor, Responder};
    use crate::sentiment::{Emotion, EmotionPrediction};

    /// Echoes the utterance and records the sentiment it was given.
    struct EchoResponder {
        sentiments: RefCell<Vec<String>>,
    }

    impl Responder for EchoResponder {
        fn respond(&self, utterance: &str, sentiment: &str) -> Result<String, BoxedError> {
            self.sentiments.borrow_mut().push(sentiment.to_string());
            Ok(format!("{utterance}!"))
        }
    }

    /// Predicts happiness for every utterance.
    struct HappyPredictor;

    impl EmotionPredictor for HappyPredictor {
        fn predict(&self, _utterance: &str) -> Result<EmotionPrediction, BoxedError> {
            Ok(EmotionPrediction {
                emotion: Emotion::Happiness,
                probabilities: [0.05, 0.1, 0.7, 0.05, 0.04, 0.03, 0.03],
            })
        }
    }

    struct FailingPredictor;

    struct FailingResponder;

    impl Responder for FailingResponder {
        fn respond(&self, _utterance: &str, _sentiment: &str) -> Result<String, BoxedError> {
            Err("prompt does not fit".into())
        }
    }

    impl EmotionPredictor for FailingPredictor {
        fn predict(&self, _utterance: &str) -> Result<EmotionPrediction, BoxedError> {
            Err("classifier unavailable".into())
        }
    }

    fn echo() -> EchoResponder {
        EchoResponder {
            sentiments: RefCell::new(Vec::new()),
        }
    }

    #[rstest]
    #[case("안녕\n오늘 날씨 좋아요\nquit\n")]
    #[case("안녕\n  \n오늘 날씨 좋아요\n  quit  \n무시됨\n")]
    #[case("안녕\n오늘 날씨 좋아요")]
    fn chats_until_quit(#[case] input: &str) {
        let dir = tempfile::tempdir().unwrap();
        let mut session = ChatSession::new(echo(), HappyPredictor, "2", dir.path());

        let mut output = Vec::new();
        session.run(Cursor::new(input), &mut output).unwrap();
        let output = String::from_utf8(output).unwrap();

        assert!(output.starts_with("user > 행복\n"));
        assert!(output.contains("Simsimi > 안녕!\n"));
        assert!(output.contains("Simsimi > 오늘 날씨 좋아요!\n"));
        assert!(output.contains("행복 0.7000"));
        assert!(!output.contains("무시됨"));

        assert_eq!(session.trajectory().len(), 2);
        assert!(session
            .trajectory()
            .iter()
            .all(|point| point.emotion == Emotion::Happiness));
        assert_eq!(*session.responder.sentiments.borrow(), ["2", "2"]);

        assert!(session.probabilities_path(0).exists());
        assert!(session.probabilities_path(1).exists());
        assert!(!session.probabilities_path(2).exists());
        assert!(session.trajectory_path().exists());
    }

    #[test]
    fn immediate_quit_plots_empty_trajectory() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = ChatSession::new(echo(), HappyPredictor, "0", dir.path());

        let mut output = Vec::new();
        session.run(Cursor::new("quit\n"), &mut output).unwrap();

        assert_eq!(String::from_utf8(output).unwrap(), "user > ");
        assert!(session.trajectory().is_empty());
        assert!(session.trajectory_path().exists());
    }

    #[test]
    fn prediction_errors_end_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = ChatSession::new(echo(), FailingPredictor, "0", dir.path());

        let result = session.run(Cursor::new("안녕\n"), Vec::new());
        assert!(result.is_err());
        assert!(session.responder.sentiments.borrow().is_empty());
        assert!(session.trajectory_path().exists());
    }

    #[test]
    fn response_errors_still_plot_the_trajectory() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = ChatSession::new(FailingResponder, HappyPredictor, "0", dir.path());

        let result = session.run(Cursor::new("안녕\n오늘 날씨 좋아요\n"), Vec::new());
        assert!(matches!(result, Err(ChatError::Respond { .. })));
        assert_eq!(session.trajectory().len(), 1);
        assert!(session.probabilities_path(0).exists());
        assert!(session.trajectory_path().exists());
    }

    #[test]
    fn formats_time_of_day() {
        let time = kst_time();
        assert_eq!(time.len(), 8);
        let parts = time
            .split(':')
            .map(|part| part.parse::<u32>().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(parts.len(), 3);
        assert!(parts[0] < 24 && parts[1] < 60 && parts[2] < 61);
    }
}
