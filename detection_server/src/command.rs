use crate::annotate::{image_dimensions, parse_yolo_labels, Annotator};
use crate::config::CommandConfig;
use crate::detector::{CancelFlag, DetectionError, Detector};
use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

const INPUT_PLACEHOLDER: &str = "{input}";
const OUTPUT_PLACEHOLDER: &str = "{output}";
const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Runs an external detection program once per image.
///
/// Every job gets its own directory under `work_dir` holding the received
/// image and the label file the program writes. The program is expected to
/// write YOLO text labels to `{output}`; no file means nothing was detected.
/// The directory is removed once the job ends, whatever the outcome.
/// A cancelled job kills the program before cleaning up.
pub struct CommandDetector {
    program: String,
    args: Vec<String>,
    work_dir: PathBuf,
    annotator: Annotator,
    next_job: AtomicU64,
}

impl CommandDetector {
    pub fn new(config: &CommandConfig, annotator: Annotator) -> io::Result<Self> {
        fs::create_dir_all(&config.work_dir)?;

        Ok(Self {
            program: config.program.clone(),
            args: config.args.clone(),
            work_dir: config.work_dir.clone(),
            annotator,
            next_job: AtomicU64::new(0),
        })
    }

    fn run_job(
        &self,
        job_dir: &Path,
        image: &[u8],
        cancel: &CancelFlag,
    ) -> Result<Vec<u8>, DetectionError> {
        let format = image::guess_format(image)
            .map_err(|e| DetectionError::InvalidImage(format!("Unknown image format: {}", e)))?;
        let extension = format.extensions_str().first().copied().unwrap_or("img");

        let input_path = job_dir.join(format!("input.{}", extension));
        let output_path = job_dir.join("detections.txt");
        fs::write(&input_path, image)?;

        let input = input_path.to_string_lossy();
        let output = output_path.to_string_lossy();
        let args = self.args.iter().map(|arg| {
            arg.replace(INPUT_PLACEHOLDER, &input)
                .replace(OUTPUT_PLACEHOLDER, &output)
        });

        let stderr_path = job_dir.join("stderr.log");
        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(File::create(&stderr_path)?))
            .spawn()
            .map_err(|e| DetectionError::Model(format!("Failed to run {}: {}", self.program, e)))?;

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if cancel.is_cancelled() {
                tracing::info!("Killing {} (pid {}), detection cancelled", self.program, child.id());
                if let Err(e) = child.kill() {
                    tracing::warn!("Failed to kill {}: {}", self.program, e);
                }
                child.wait()?;
                return Err(DetectionError::Cancelled);
            }
            std::thread::sleep(CHILD_POLL_INTERVAL);
        };

        if !status.success() {
            let stderr = fs::read_to_string(&stderr_path).unwrap_or_default();
            return Err(DetectionError::Model(format!(
                "{} exited with {}: {}",
                self.program,
                status,
                stderr.trim()
            )));
        }

        let labels = match fs::read_to_string(&output_path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        let (img_width, img_height) = image_dimensions(image)?;
        let boxes = parse_yolo_labels(&labels, img_width, img_height)?;
        tracing::debug!("{} reported {} raw detections", self.program, boxes.len());

        self.annotator.annotate(image, boxes)
    }
}

impl Detector for CommandDetector {
    fn detect(&self, image: &[u8]) -> Result<Vec<u8>, DetectionError> {
        self.detect_cancellable(image, &CancelFlag::default())
    }

    fn detect_cancellable(
        &self,
        image: &[u8],
        cancel: &CancelFlag,
    ) -> Result<Vec<u8>, DetectionError> {
        let job_id = self.next_job.fetch_add(1, Ordering::SeqCst);
        let job_dir = self
            .work_dir
            .join(format!("job-{}-{}", std::process::id(), job_id));
        fs::create_dir_all(&job_dir)?;

        let result = self.run_job(&job_dir, image, cancel);

        if let Err(e) = fs::remove_dir_all(&job_dir) {
            tracing::warn!("Failed to remove job directory {:?}: {}", job_dir, e);
        }

        result
    }
}
