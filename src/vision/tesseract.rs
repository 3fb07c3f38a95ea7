//! Tesseract command-line backend
//!
//! Each crop is PNG-encoded in memory and piped through
//! `tesseract stdin stdout`. A watchdog kills calls that run past the
//! configured timeout so one stuck region cannot stall a batch.

use image::{GrayImage, ImageFormat};
use std::io::{Cursor, Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::OcrSettings;
use crate::error::{FormscanError, Result};
use crate::vision::ocr::OcrBackend;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Captured result of a finished child process
#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// OCR backend that shells out to the tesseract executable
#[derive(Debug, Clone)]
pub struct TesseractCli {
    program: String,
    languages: String,
    page_seg_mode: u8,
    engine_mode: u8,
    timeout: Option<Duration>,
}

impl TesseractCli {
    /// Create the backend, probing the executable once.
    ///
    /// A missing or broken executable is a configuration error; callers
    /// should treat it as fatal before any batch starts.
    pub fn new(settings: &OcrSettings) -> Result<Self> {
        let backend = Self {
            program: settings.tesseract_cmd.clone(),
            languages: settings.languages.clone(),
            page_seg_mode: settings.page_seg_mode,
            engine_mode: settings.engine_mode,
            timeout: (settings.timeout_secs > 0)
                .then(|| Duration::from_secs(settings.timeout_secs)),
        };
        let version = backend.check_version()?;
        info!("Using {} ({})", backend.program, version);
        Ok(backend)
    }

    fn check_version(&self) -> Result<String> {
        let output = Command::new(&self.program)
            .arg("--version")
            .output()
            .map_err(|e| {
                FormscanError::Config(format!(
                    "cannot run '{}': {e}; is tesseract installed?",
                    self.program
                ))
            })?;

        if !output.status.success() {
            return Err(FormscanError::Config(format!(
                "'{} --version' exited with {}",
                self.program, output.status
            )));
        }

        // Older releases print the banner on stderr
        let banner = if output.stdout.is_empty() {
            output.stderr
        } else {
            output.stdout
        };
        Ok(String::from_utf8_lossy(&banner)
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .to_string())
    }

    /// Command-line arguments for a single-line recognition call
    pub fn args(&self) -> Vec<String> {
        vec![
            "stdin".to_string(),
            "stdout".to_string(),
            "--psm".to_string(),
            self.page_seg_mode.to_string(),
            "--oem".to_string(),
            self.engine_mode.to_string(),
            "-l".to_string(),
            self.languages.clone(),
        ]
    }
}

impl OcrBackend for TesseractCli {
    fn name(&self) -> &str {
        "tesseract"
    }

    fn recognize_line(&self, image: &GrayImage) -> Result<String> {
        let mut png = Vec::new();
        image.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;

        let mut command = Command::new(&self.program);
        command.args(self.args());
        let output = run_with_watchdog(&mut command, png, self.timeout)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FormscanError::Extraction(format!(
                "tesseract exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Run a command with `input` on stdin, collecting stdout and stderr.
///
/// With a timeout the child is killed once it expires and the call fails with
/// [`FormscanError::Extraction`].
pub fn run_with_watchdog(
    command: &mut Command,
    input: Vec<u8>,
    timeout: Option<Duration>,
) -> Result<ProcessOutput> {
    let mut child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdin = child.stdin.take();
    let writer = thread::spawn(move || {
        if let Some(mut stdin) = stdin {
            // Child may exit without reading everything
            let _ = stdin.write_all(&input);
        }
    });
    let stdout_reader = spawn_reader(child.stdout.take());
    let stderr_reader = spawn_reader(child.stderr.take());

    let started = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if let Some(limit) = timeout {
            if started.elapsed() >= limit {
                let _ = child.kill();
                let _ = child.wait();
                debug!("Killed child after {:?}", started.elapsed());
                return Err(FormscanError::Extraction(format!(
                    "OCR call timed out after {}ms",
                    limit.as_millis()
                )));
            }
        }
        thread::sleep(POLL_INTERVAL);
    };

    let _ = writer.join();
    let stdout = join_reader(stdout_reader)?;
    let stderr = join_reader(stderr_reader)?;

    Ok(ProcessOutput {
        status,
        stdout,
        stderr,
    })
}

fn spawn_reader<R: Read + Send + 'static>(
    pipe: Option<R>,
) -> thread::JoinHandle<std::io::Result<Vec<u8>>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            pipe.read_to_end(&mut buf)?;
        }
        Ok(buf)
    })
}

fn join_reader(handle: thread::JoinHandle<std::io::Result<Vec<u8>>>) -> Result<Vec<u8>> {
    handle
        .join()
        .map_err(|_| FormscanError::Extraction("pipe reader panicked".to_string()))?
        .map_err(FormscanError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_executable_is_config_error() {
        let settings = OcrSettings {
            tesseract_cmd: "/nonexistent/bin/tesseract-formscan".to_string(),
            ..OcrSettings::default()
        };
        let result = TesseractCli::new(&settings);
        assert!(matches!(result, Err(FormscanError::Config(_))));
    }

    #[test]
    fn test_args_single_line_mode() {
        let backend = TesseractCli {
            program: "tesseract".to_string(),
            languages: "kor+eng".to_string(),
            page_seg_mode: 7,
            engine_mode: 3,
            timeout: None,
        };
        assert_eq!(
            backend.args(),
            vec!["stdin", "stdout", "--psm", "7", "--oem", "3", "-l", "kor+eng"]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_watchdog_pipes_stdin_to_stdout() {
        let mut command = Command::new("cat");
        let output =
            run_with_watchdog(&mut command, b"12,345".to_vec(), Some(Duration::from_secs(10)))
                .unwrap();

        assert!(output.status.success());
        assert_eq!(output.stdout, b"12,345");
    }

    #[cfg(unix)]
    #[test]
    fn test_watchdog_kills_slow_child() {
        let mut command = Command::new("sleep");
        command.arg("5");

        let started = Instant::now();
        let result = run_with_watchdog(&mut command, Vec::new(), Some(Duration::from_millis(100)));

        assert!(matches!(result, Err(FormscanError::Extraction(_))));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[test]
    fn test_watchdog_reports_exit_status() {
        let mut command = Command::new("sh");
        command.args(["-c", "echo oops >&2; exit 3"]);

        let output = run_with_watchdog(&mut command, Vec::new(), None).unwrap();
        assert_eq!(output.status.code(), Some(3));
        assert_eq!(String::from_utf8_lossy(&output.stderr).trim(), "oops");
    }
}
