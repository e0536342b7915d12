//! Follows systemd's `Reloading` signal. A daemon reload rewrites the device
//! cgroup settings of the units it manages, so every reload triggers a re-scan.

use std::time::Duration;

use dbus::blocking::Connection;
use dbus::message::MatchRule;
use dbus::Message;
use tokio::sync::{mpsc, watch};

use crate::daemon::Trigger;

const MANAGER_INTERFACE: &str = "org.freedesktop.systemd1.Manager";
const RELOADING_SIGNAL: &str = "Reloading";
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Payload of `Reloading` is a single boolean, anything else counts as inactive.
pub fn decode_reloading(msg: &Message) -> bool {
    msg.read1::<bool>().unwrap_or(false)
}

/// Runs on a blocking thread until `shutdown` turns true. A missing system bus
/// only disables reload handling.
pub fn run(triggers: mpsc::Sender<Trigger>, shutdown: watch::Receiver<bool>) {
    let conn = match Connection::new_system() {
        Ok(conn) => conn,
        Err(err) => {
            tracing::warn!("systemd reload notifications unavailable: {}", err);
            return;
        }
    };

    if let Err(err) = listen(&conn, triggers, &shutdown) {
        tracing::warn!("stopped listening for systemd reloads: {}", err);
    }
}

fn listen(
    conn: &Connection,
    triggers: mpsc::Sender<Trigger>,
    shutdown: &watch::Receiver<bool>,
) -> Result<(), dbus::Error> {
    let rule = MatchRule::new_signal(MANAGER_INTERFACE, RELOADING_SIGNAL);
    conn.add_match(rule, move |_: (), _, msg: &Message| {
        let active = decode_reloading(msg);
        tracing::info!(active, "systemd is reloading");
        // a closed channel means the daemon is going away, drop the match
        triggers.blocking_send(Trigger::Reload { active }).is_ok()
    })?;
    tracing::debug!("listening for systemd reloads");

    while !*shutdown.borrow() {
        conn.process(POLL_INTERVAL)?;
    }

    Ok(())
}
