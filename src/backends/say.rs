use super::{Speech, SpeechBackend};
use crate::config_loader::SaySayerSettings;
use crate::error::{Result, SayerError};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::process::Command;
use tracing::{debug, warn};

/// Runs a macOS-style SAY(1) command that writes its audio to a file.
///
/// The role selects the voice and rate:
///
///   "{voice}"          // say -v {voice}
///   "{voice}:{rate}"   // say -v {voice} -r {rate}
///   ":{rate}"          // say -r {rate}
pub struct SaySayer {
    command: String,
    format: String,
    clean: bool,
    /// Private to this instance, created in `new`.
    tmpdir: PathBuf,
    artifacts: Artifacts,
}

/// Requests currently using each artifact path. Identical requests take turns
/// on their shared file and only the last one out may delete it.
#[derive(Default)]
struct Artifacts {
    slots: Mutex<HashMap<PathBuf, Slot>>,
}

struct Slot {
    users: usize,
    turn: Arc<tokio::sync::Mutex<()>>,
}

impl Artifacts {
    /// Registers a user of `path` and hands back the lock it must hold while
    /// writing and reading the file.
    fn enter(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let slot = slots.entry(path.to_path_buf()).or_insert_with(|| Slot {
            users: 0,
            turn: Arc::new(tokio::sync::Mutex::new(())),
        });
        slot.users += 1;
        slot.turn.clone()
    }

    /// Unregisters one user; returns how many are still waiting on `path`.
    fn leave(&self, path: &Path) -> usize {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        match slots.get_mut(path) {
            Some(slot) => {
                slot.users = slot.users.saturating_sub(1);
                slot.users
            }
            None => 0,
        }
    }

    fn forget_if_idle(&self, path: &Path) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if slots.get(path).is_some_and(|slot| slot.users == 0) {
            slots.remove(path);
        }
    }
}

impl SaySayer {
    pub fn new(settings: &SaySayerSettings) -> Result<Self> {
        let tmpdir = tempfile::Builder::new()
            .prefix("sayerd-say-")
            .tempdir()?
            .keep();
        debug!(tmpdir = %tmpdir.display(), "say sayer created");

        Ok(Self {
            command: settings.command.clone(),
            format: settings.format.clone(),
            clean: settings.clean,
            tmpdir,
            artifacts: Artifacts::default(),
        })
    }

    pub fn tmpdir(&self) -> &Path {
        &self.tmpdir
    }

    /// Runs the command for `job` and reads back what it wrote.
    async fn synthesize(&self, job: &SayJob<'_>, output_file: &Path) -> Result<Vec<u8>> {
        let output = Command::new(&self.command)
            .args(job.args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| SayerError::LocalSynthesis(format!("running {}: {}", self.command, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SayerError::LocalSynthesis(format!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                stderr.trim()
            )));
        }

        tokio::fs::read(output_file).await.map_err(|e| {
            SayerError::LocalSynthesis(format!("reading {}: {}", output_file.display(), e))
        })
    }
}

#[async_trait]
impl SpeechBackend for SaySayer {
    fn id(&self) -> &'static str {
        "say"
    }

    async fn speak(&self, role: &str, text: &str) -> Result<Speech> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Speech::empty());
        }

        let (voice, rate) = parse_role(role.trim());
        let job = SayJob {
            voice,
            rate,
            format: &self.format,
            text,
            outputdir: &self.tmpdir,
        };
        let output_file = job.output_file();

        let turn = self.artifacts.enter(&output_file);
        let result = {
            let _turn = turn.lock().await;
            let result = self.synthesize(&job, &output_file).await;
            if self.artifacts.leave(&output_file) == 0 && self.clean {
                if let Err(e) = tokio::fs::remove_file(&output_file).await {
                    debug!(file = %output_file.display(), error = %e, "could not remove artifact");
                }
            }
            result
        };
        self.artifacts.forget_if_idle(&output_file);

        Ok(Speech {
            format: self.format.clone(),
            audio: result?,
        })
    }

    async fn close(&self) {
        if !self.clean {
            return;
        }
        match tokio::fs::remove_dir_all(&self.tmpdir).await {
            Ok(()) => debug!(tmpdir = %self.tmpdir.display(), "removed temp dir"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(tmpdir = %self.tmpdir.display(), error = %e, "could not remove temp dir"),
        }
    }
}

/// Splits "voice:rate"; either half may be missing or empty.
fn parse_role(role: &str) -> (&str, &str) {
    let mut parts = role.split(':');
    let voice = parts.next().unwrap_or_default();
    let rate = parts.next().unwrap_or_default();
    (voice, rate)
}

/// One invocation of the say command.
struct SayJob<'a> {
    voice: &'a str,
    rate: &'a str,
    format: &'a str,
    text: &'a str,
    outputdir: &'a Path,
}

impl SayJob<'_> {
    /// `{outputdir}/{hash}.{format}`
    fn output_file(&self) -> PathBuf {
        self.outputdir.join(format!("{}.{}", self.hash(), self.format))
    }

    /// Hex SHA-256 over the NUL-separated inputs. A naming scheme, not a cache key:
    /// the command always runs and overwrites the file.
    fn hash(&self) -> String {
        let mut h = Sha256::new();
        for part in [self.voice, self.rate, self.format, self.text] {
            h.update(part.as_bytes());
            h.update([0u8]);
        }
        hex::encode(h.finalize())
    }

    fn args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            self.output_file().to_string_lossy().into_owned(),
        ];
        if !self.voice.is_empty() {
            args.push("-v".to_string());
            args.push(self.voice.to_string());
        }
        if !self.rate.is_empty() {
            args.push("-r".to_string());
            args.push(self.rate.to_string());
        }
        args.push(self.text.to_string());
        args
    }
}
