/*!
 * Utility functions shared by devices and procedures.
 */
use std::future::Future;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Run a future with a timeout
///
/// # Arguments
///
/// * `duration` - The timeout duration
/// * `future` - The future to run
///
/// # Returns
///
/// The result of the future, or a timeout error if the timeout is reached
pub async fn with_timeout<F, T, E>(duration: Duration, future: F) -> std::result::Result<T, E>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: From<Error>,
{
    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(format!("Operation timed out after {:?}", duration)).into()),
    }
}

/// Spawn a background task and log its outcome
///
/// # Arguments
///
/// * `name` - A name for the task (for logging)
/// * `fut` - The future to run
pub fn spawn_and_log<F, T, E>(name: &str, fut: F) -> tokio::task::JoinHandle<Option<T>>
where
    F: Future<Output = std::result::Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let task_name = name.to_string();
    tokio::spawn(async move {
        match fut.await {
            Ok(value) => {
                debug!("Task '{}' completed successfully", task_name);
                Some(value)
            }
            Err(e) => {
                warn!("Task '{}' failed: {}", task_name, e);
                None
            }
        }
    })
}

/// Sentence-case each sentence and make sure the text ends with a period.
///
/// Status text reported by controllers arrives in arbitrary case and unpunctuated.
pub fn format_sentences(text: &str) -> String {
    let text = text.trim();
    if text.is_empty() {
        return String::new();
    }

    let mut sentences: Vec<String> = text
        .split(". ")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            let mut chars = s.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect(),
                None => String::new(),
            }
        })
        .collect();

    if let Some(last) = sentences.last_mut() {
        if !last.ends_with('.') {
            last.push('.');
        }
    }
    sentences.join(". ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_timeout_success() {
        let result: Result<i32> = with_timeout(Duration::from_secs(1), async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_failure() {
        let result: Result<i32> = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(42)
        })
        .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn test_spawn_and_log() {
        let ok = spawn_and_log("ok", async { Ok::<_, Error>(7) }).await.unwrap();
        assert_eq!(ok, Some(7));
        let failed = spawn_and_log("fails", async { Err::<i32, _>(Error::other("boom")) })
            .await
            .unwrap();
        assert_eq!(failed, None);
    }

    #[test]
    fn test_format_sentences() {
        assert_eq!(format_sentences("robot is homing"), "Robot is homing.");
        assert_eq!(
            format_sentences("gripper CLOSED. moving to dewar"),
            "Gripper closed. Moving to dewar."
        );
        assert_eq!(format_sentences("Done."), "Done.");
        assert_eq!(format_sentences("   "), "");
    }
}
