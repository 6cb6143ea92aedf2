//! BlueZ GATT notification source (D-Bus system bus).

use dbus::arg::{RefArg, Variant};
use dbus::blocking::stdintf::org_freedesktop_dbus::PropertiesPropertiesChanged as PC;
use dbus::blocking::Connection;
use dbus::channel::Sender;
use dbus::message::SignalArgs;
use dbus::Message;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::frame_decoder::{DecoderStats, FrameDecoder};
use crate::sample_queue::SampleProducer;
use crate::shutdown::Shutdown;

const ADAPTER_PATH: &str = "/org/bluez/hci0";
const STATS_INTERVAL: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum BleError {
    #[error("D-Bus error: {0}")]
    DBus(#[from] dbus::Error),

    #[error("Could not connect to {device}: {source}")]
    Connect {
        device: String,
        source: dbus::Error,
    },

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("D-Bus connection lost")]
    ConnectionLost,
}

/// D-Bus object path of a device under the default adapter
pub fn device_path(mac: &str) -> String {
    format!("{}/dev_{}", ADAPTER_PATH, mac.replace(':', "_"))
}

/// Decodes a payload carried in a `PropertiesChanged` "Value" entry
fn notification_bytes(value: &Variant<Box<dyn RefArg>>) -> Option<Vec<u8>> {
    value
        .0
        .as_iter()
        .map(|iter| iter.filter_map(|item| item.as_u64().map(|b| b as u8)).collect())
}

/// Calls `step` with waits of at most `poll` until it yields a value, `timeout`
/// passes, or shutdown is triggered (`Ok(None)`).
fn wait_interruptible<T>(
    what: &'static str,
    timeout: Duration,
    poll: Duration,
    shutdown: &Shutdown,
    mut step: impl FnMut(Duration) -> Result<Option<T>, BleError>,
) -> Result<Option<T>, BleError> {
    let deadline = Instant::now() + timeout;
    loop {
        if shutdown.is_triggered() {
            return Ok(None);
        }
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(BleError::Timeout(what));
        }
        if let Some(value) = step(poll.min(left))? {
            return Ok(Some(value));
        }
    }
}

/// Issues `Device1.Connect` and polls for its reply, so a shutdown during a slow
/// connect is seen within one poll interval. `Ok(false)` means interrupted.
fn connect_device(
    conn: &Connection,
    path: &str,
    shutdown: &Shutdown,
    poll: Duration,
) -> Result<bool, BleError> {
    let msg = Message::new_method_call("org.bluez", path, "org.bluez.Device1", "Connect")
        .map_err(|e| BleError::DBus(dbus::Error::new_failed(&e)))?;
    let serial = conn
        .channel()
        .send(msg)
        .map_err(|()| BleError::ConnectionLost)?;

    let reply = wait_interruptible("Connect", CONNECT_TIMEOUT, poll, shutdown, |wait| {
        conn.channel()
            .read_write(Some(wait))
            .map_err(|()| BleError::ConnectionLost)?;
        while let Some(msg) = conn.channel().pop_message() {
            if msg.get_reply_serial() == Some(serial) {
                return Ok(Some(msg));
            }
        }
        Ok(None)
    })?;

    match reply {
        Some(mut reply) => {
            reply.as_result()?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Streams notifications of `characteristic` (relative to the device path, e.g.
/// `service0001/char0002`) through `decoder` into the sample queue until shutdown.
/// Notifications are stopped and the device disconnected on the way out.
pub fn run_ble_source(
    mac: &str,
    characteristic: &str,
    decoder: FrameDecoder,
    producer: SampleProducer,
    shutdown: &Shutdown,
    poll_interval: Duration,
) -> Result<DecoderStats, BleError> {
    let conn = Connection::new_system()?;
    debug!("connected to the system bus");

    let adapter = conn.with_proxy("org.bluez", ADAPTER_PATH, Duration::from_secs(5));
    let _: () = adapter.method_call(
        "org.freedesktop.DBus.Properties",
        "Set",
        ("org.bluez.Adapter1", "Powered", Variant(true)),
    )?;
    let stop: Result<(), _> = adapter.method_call("org.bluez.Adapter1", "StopDiscovery", ());
    if let Err(e) = stop {
        if !e.to_string().contains("No discovery started") {
            warn!(error = %e, "could not stop discovery");
        }
    }

    let device_path = device_path(mac);
    let device = conn.with_proxy("org.bluez", &device_path, Duration::from_secs(5));
    let connected = match connect_device(&conn, &device_path, shutdown, poll_interval) {
        Ok(connected) => connected,
        Err(e) => {
            warn!(device = %mac, error = %e, "connect failed, retrying in 3 s");
            if shutdown.wait_timeout(Duration::from_secs(3)) {
                return Ok(decoder.stats());
            }
            connect_device(&conn, &device_path, shutdown, poll_interval).map_err(|e| match e {
                BleError::DBus(source) => BleError::Connect {
                    device: mac.to_string(),
                    source,
                },
                other => other,
            })?
        }
    };
    if !connected {
        return Ok(decoder.stats());
    }
    info!(device = %mac, "connected");

    let char_path = format!("{}/{}", device_path, characteristic.trim_matches('/'));
    let char_proxy = conn.with_proxy("org.bluez", &char_path, Duration::from_secs(5));
    char_proxy.method_call::<(), _, _, _>("org.bluez.GattCharacteristic1", "StartNotify", ())?;
    info!(characteristic = %char_path, "notifications started");

    let decoder = Arc::new(Mutex::new(decoder));
    let handler_decoder = Arc::clone(&decoder);
    let handler_shutdown = shutdown.clone();
    let watched = char_path.clone();
    conn.add_match(PC::match_rule(None, None), move |pc: PC, _, msg| {
        if msg.path().map(|p| p.to_string()).as_deref() != Some(watched.as_str()) {
            return true;
        }
        if let Some(bytes) = pc.changed_properties.get("Value").and_then(notification_bytes) {
            let samples = handler_decoder.lock().feed(&bytes);
            if !producer.push_all(samples) {
                handler_shutdown.trigger();
            }
        }
        true
    })?;

    let mut last_report = Instant::now();
    let result = loop {
        if shutdown.is_triggered() {
            break Ok(());
        }
        if let Err(e) = conn.process(poll_interval) {
            break Err(BleError::from(e));
        }
        if last_report.elapsed() >= STATS_INTERVAL {
            debug!(stats = ?decoder.lock().stats(), "ble decoder");
            last_report = Instant::now();
        }
    };

    if let Err(e) =
        char_proxy.method_call::<(), _, _, _>("org.bluez.GattCharacteristic1", "StopNotify", ())
    {
        warn!(error = %e, "StopNotify failed");
    }
    if let Err(e) = device.method_call::<(), _, _, _>("org.bluez.Device1", "Disconnect", ()) {
        warn!(error = %e, "Disconnect failed");
    }
    info!(device = %mac, "ble source stopped");

    let stats = decoder.lock().stats();
    result.map(|()| stats)
}
