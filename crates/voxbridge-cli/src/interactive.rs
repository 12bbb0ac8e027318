//! Menu loop: requests are dispatched and the menu comes straight back;
//! results are printed whenever they arrive.

use std::path::PathBuf;
use std::time::Duration;

use dialoguer::Input;
use tracing::error;

use voxbridge_relay::output::save_synthesis;

use crate::Session;

enum Choice {
    Recognize,
    Synthesize,
    Quit,
    Unknown(String),
}

fn parse_choice(input: &str) -> Choice {
    match input.trim() {
        "1" => Choice::Recognize,
        "2" => Choice::Synthesize,
        "no" | "q" | "quit" => Choice::Quit,
        other => Choice::Unknown(other.to_string()),
    }
}

async fn prompt(label: &'static str) -> anyhow::Result<String> {
    let answer = tokio::task::spawn_blocking(move || {
        Input::<String>::new().with_prompt(label).interact_text()
    })
    .await??;
    Ok(answer)
}

/// Cancel the wait once `timeout` has passed.
fn arm_timeout(cancel: tokio_util::sync::CancellationToken, timeout: Option<Duration>) {
    if let Some(timeout) = timeout {
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(timeout) => cancel.cancel(),
            }
        });
    }
}

pub async fn run(
    session: &Session,
    out_dir: PathBuf,
    default_ext: String,
    timeout: Option<Duration>,
) -> anyhow::Result<()> {
    loop {
        let choice = prompt("1 = audio to text, 2 = text to audio, no = quit").await?;

        match parse_choice(&choice) {
            Choice::Quit => return Ok(()),
            Choice::Unknown(other) => println!("Unknown choice '{other}'"),
            Choice::Recognize => {
                let path = prompt("Audio file").await?;
                let audio = match tokio::fs::read(path.trim()).await {
                    Ok(audio) => audio,
                    Err(e) => {
                        println!("Cannot read {}: {e}", path.trim());
                        continue;
                    }
                };

                let pending = match session.client.recognition().dispatch(audio).await {
                    Ok(pending) => pending,
                    Err(e) => {
                        error!(%e, "Failed to dispatch recognition request");
                        continue;
                    }
                };
                println!("Sent recognition request {}", pending.token().short());
                arm_timeout(pending.cancellation(), timeout);
                pending.on_complete(|token, result| match result {
                    Ok(response) => println!("[{}] {}", token.short(), response.result),
                    Err(e) => println!("[{}] recognition failed: {e}", token.short()),
                });
            }
            Choice::Synthesize => {
                let text = prompt("Text").await?;

                let pending = match session.client.synthesis().dispatch(text).await {
                    Ok(pending) => pending,
                    Err(e) => {
                        error!(%e, "Failed to dispatch synthesis request");
                        continue;
                    }
                };
                println!("Sent synthesis request {}", pending.token().short());
                arm_timeout(pending.cancellation(), timeout);

                let out_dir = out_dir.clone();
                let default_ext = default_ext.clone();
                pending.on_complete(move |token, result| {
                    let audio = match result.and_then(|response| response.audio_bytes()) {
                        Ok(audio) => audio,
                        Err(e) => {
                            println!("[{}] synthesis failed: {e}", token.short());
                            return;
                        }
                    };
                    tokio::spawn(async move {
                        match save_synthesis(&out_dir, &token, &audio, &default_ext).await {
                            Ok(path) => println!("[{}] saved {}", token.short(), path.display()),
                            Err(e) => println!("[{}] could not save audio: {e}", token.short()),
                        }
                    });
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_menu_choices() {
        assert!(matches!(parse_choice("1"), Choice::Recognize));
        assert!(matches!(parse_choice(" 2\n"), Choice::Synthesize));
        assert!(matches!(parse_choice("no"), Choice::Quit));
        assert!(matches!(parse_choice("3"), Choice::Unknown(s) if s == "3"));
    }
}
