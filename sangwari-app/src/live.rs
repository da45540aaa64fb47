//! Terminal front-end for a live voice call.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sangwari_core::{
    audio::output::OutputStreamHandle, CallController, CallHandle, CallStatus, CpalMicrophone,
    Mixer, SessionTransport,
};
use tokio::io::{BufReader, Lines, Stdin};
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tracing::{info, warn};

use crate::settings::AppSettings;

pub type InputLines = Lines<BufReader<Stdin>>;

const METER_WIDTH: usize = 20;
const METER_REFRESH: Duration = Duration::from_millis(200);

/// Level bar for an RMS value. Normal speech (around 0.05 RMS) fills it.
pub fn meter(rms: f32) -> String {
    let scaled = (rms.max(0.0) * 100.0 * METER_WIDTH as f32 / 5.0).round() as usize;
    let filled = scaled.min(METER_WIDTH);
    format!("[{}{}]", "#".repeat(filled), " ".repeat(METER_WIDTH - filled))
}

fn status_line(handle: &CallHandle) -> String {
    let mute = if handle.is_muted() { " (muted)" } else { "" };
    format!(
        "\r{:<18}{} {}",
        handle.status().label(),
        meter(handle.volume_level()),
        mute
    )
}

/// Place a call and drive it from stdin until the user hangs up.
///
/// `m` toggles the microphone, `q` (or end of input) ends the call.
pub async fn run_call(
    settings: &AppSettings,
    api_key: String,
    input: &mut InputLines,
) -> anyhow::Result<()> {
    let config = settings.call_config(api_key);
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let mixer = Mixer::new(config.output_sample_rate, config.output_gain, events_tx.clone());
    let output = OutputStreamHandle::open(mixer.clone(), config.output_device.clone());
    if let Ok(stream) = output.as_ref() {
        info!(
            sample_rate = stream.sample_rate,
            channels = stream.channels,
            "speaker ready"
        );
    }

    let transport = SessionTransport::open(config.session.clone(), events_tx.clone());
    let microphone = CpalMicrophone::new(config.input_device.clone());
    let mut controller = CallController::new(
        config,
        mixer.clone(),
        Arc::new(transport),
        Box::new(microphone),
        events_tx,
    );
    match output {
        Ok(stream) => mixer.attach(stream),
        Err(e) => {
            warn!("speaker unavailable: {e}");
            controller.report_failure(&e);
        }
    }

    let handle = controller.handle();
    let mut statuses = handle.subscribe_status();
    let call = tokio::spawn(controller.run(events_rx));

    println!("Calling Sangwari. Type `m` + Enter to mute, `q` + Enter to hang up.");
    let mut ticker = tokio::time::interval(METER_REFRESH);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                print!("{}", status_line(&handle));
                let _ = std::io::stdout().flush();
            }
            changed = statuses.recv() => match changed {
                Ok(event) => {
                    if let Some(detail) = event.detail {
                        println!("\n{}: {detail}", event.status.label());
                    }
                    if event.status == CallStatus::Connecting {
                        println!("\nSession closed. Hang up with `q` and call again.");
                    }
                }
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            line = input.next_line() => {
                match line.context("reading stdin")? {
                    Some(cmd) if cmd.trim().eq_ignore_ascii_case("m") => {
                        let muted = handle.toggle_mute();
                        println!("\n{}", if muted { "Microphone muted" } else { "Microphone live" });
                    }
                    Some(cmd) if cmd.trim().eq_ignore_ascii_case("q") => break,
                    Some(_) => {}
                    None => break,
                }
            }
        }
    }

    handle.end_call();
    let snapshot = call.await.context("call task panicked")?;
    println!(
        "\nCall ended. {} replies played, {} interruptions.",
        snapshot.buffers_scheduled, snapshot.interruptions
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::meter;

    #[test]
    fn meter_scales_and_saturates() {
        assert_eq!(meter(0.0), format!("[{}]", " ".repeat(20)));
        assert_eq!(meter(0.025), format!("[{}{}]", "#".repeat(10), " ".repeat(10)));
        assert_eq!(meter(0.9), format!("[{}]", "#".repeat(20)));
        assert_eq!(meter(-1.0), format!("[{}]", " ".repeat(20)));
    }
}
