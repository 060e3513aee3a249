//! Process signalling.

use crate::error::SignalError;

/// Send SIGTERM to `pid` through the system `kill` utility.
pub fn terminate(pid: u32) -> Result<(), SignalError> {
    send(pid, "-TERM")
}

fn send(pid: u32, signal: &str) -> Result<(), SignalError> {
    let output = std::process::Command::new("kill")
        .args([signal, &pid.to_string()])
        .output()
        .map_err(|e| SignalError::Failed {
            pid,
            reason: e.to_string(),
        })?;

    if output.status.success() {
        tracing::debug!(pid = pid, signal = signal, "Signal sent");
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains("No such process") {
        Err(SignalError::ProcessGone { pid })
    } else {
        Err(SignalError::Failed {
            pid,
            reason: stderr.trim().to_string(),
        })
    }
}

/// Wait for SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!("Failed to register SIGTERM handler: {}", e);
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

/// Wait for SIGTERM only. Never resolves if the handler cannot be set up.
pub async fn terminate_signal() {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to register SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }

    #[cfg(not(unix))]
    std::future::pending::<()>().await;
}
