use std::io::{BufRead, Write};

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::cancel::CancelToken;
use crate::http_probe::result::ProbeOutcome;
use crate::telemetry::RunReport;

/// Asks whether certificate details may be included in the report.
#[async_trait]
pub trait ConsentPrompt: Send + Sync {
    /// `None` means the question was dismissed without an answer.
    async fn ask(&self, summary: &str) -> Option<bool>;
}

/// Answers every prompt the same way (`--yes` / `--no-consent`).
pub struct AutoConsent(pub bool);

#[async_trait]
impl ConsentPrompt for AutoConsent {
    async fn ask(&self, _summary: &str) -> Option<bool> {
        Some(self.0)
    }
}

/// Interactive yes/no on the controlling terminal.
pub struct TerminalPrompt;

#[async_trait]
impl ConsentPrompt for TerminalPrompt {
    async fn ask(&self, summary: &str) -> Option<bool> {
        let summary = summary.to_string();
        let (tx, rx) = oneshot::channel();
        // detached, so an abandoned read never holds up exit
        std::thread::spawn(move || {
            let mut stdout = std::io::stdout();
            let _ = write!(
                stdout,
                "{summary}\nInclude certificate details in the report? [y/n] "
            );
            let _ = stdout.flush();

            let mut line = String::new();
            let answer = match std::io::stdin().lock().read_line(&mut line) {
                Ok(0) => None,
                Ok(_) => Some(line),
                Err(e) => {
                    log::warn!("Failed to read answer: {e}");
                    Some(String::new())
                }
            };
            let _ = tx.send(answer);
        });

        match rx.await {
            Ok(Some(line)) => parse_answer(&line),
            // stdin closed, nobody can answer
            Ok(None) => {
                log::warn!("No terminal to ask for consent; leaving certificate details out");
                Some(false)
            }
            Err(e) => {
                log::warn!("Consent prompt failed: {e}");
                Some(false)
            }
        }
    }
}

fn parse_answer(line: &str) -> Option<bool> {
    match line.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Some(true),
        "n" | "no" => Some(false),
        _ => None,
    }
}

/// Asks until the prompt gives a definite answer.
pub async fn is_permitted(prompt: &dyn ConsentPrompt, summary: &str) -> bool {
    loop {
        if let Some(answer) = prompt.ask(summary).await {
            return answer;
        }
        log::debug!("Consent prompt dismissed, asking again");
    }
}

/// `is_permitted`, except that cancelling the run declines instead of
/// waiting for an answer.
pub async fn is_permitted_unless_cancelled(
    prompt: &dyn ConsentPrompt,
    summary: &str,
    cancel: &CancelToken,
) -> bool {
    tokio::select! {
        biased;
        answer = is_permitted(prompt, summary) => answer,
        _ = cancel.cancelled() => {
            log::warn!("Interrupted; leaving certificate details out");
            false
        }
    }
}

/// Short description of a finished run for the consent question.
pub fn summarize(report: &RunReport) -> String {
    let total = report.results.len();
    let loaded = report
        .results
        .iter()
        .filter(|r| r.outcome == ProbeOutcome::Loaded)
        .count();
    let chains = report
        .results
        .iter()
        .filter(|r| r.info.certificate_chain.is_some())
        .count();
    let untrusted_roots = report
        .results
        .iter()
        .filter(|r| r.info.is_built_in_root() == Some(false))
        .count();

    let mut summary = format!(
        "{loaded} of {total} probes loaded; {chains} returned a certificate chain."
    );
    if untrusted_roots > 0 {
        summary.push_str(&format!(
            " {untrusted_roots} chain(s) ended in a root that is not part of the system trust store."
        ));
    }
    summary
}
