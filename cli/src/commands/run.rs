//! Run command implementation.

use lanlink_core::protocol::DeviceType;
use lanlink_core::{Config, LanlinkService, LinkEvent};

use crate::ui::print_banner;

/// Run the lanlink service.
pub async fn run_service(
    device_name: String,
    device_type: DeviceType,
    config: Config,
) -> anyhow::Result<()> {
    print_banner();

    let mut service = LanlinkService::with_config(device_name, device_type, config)?;

    println!("\x1b[1mDevice:\x1b[0m {}", service.device_name());
    println!("\x1b[1mID:\x1b[0m     {}", service.device_id());
    println!("\x1b[1mKey:\x1b[0m    {}", service.fingerprint());

    let mut events = service.start().await?;

    println!("\n\x1b[1;32m✓\x1b[0m Broadcasting heartbeats and listening for devices...");
    println!("\x1b[2mPress Ctrl+C to stop.\x1b[0m\n");

    // Handle Ctrl+C gracefully
    let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(1);
    ctrlc::set_handler(move || {
        let _ = tx.blocking_send(());
    })?;

    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                handle_event(&service, event).await;
            }
            _ = rx.recv() => {
                println!("\n\x1b[1;33mShutting down...\x1b[0m");
                break;
            }
        }
    }

    service.stop().await;
    Ok(())
}

/// Handle a service event and print appropriate output.
async fn handle_event(service: &LanlinkService, event: LinkEvent) {
    match event {
        LinkEvent::DeviceDiscovered(device) => {
            println!(
                "\x1b[1;32m⬤\x1b[0m Found: \x1b[1m{}\x1b[0m ({}) at {}:{}",
                device.display_name, device.device_type, device.ip, device.port
            );
        }
        LinkEvent::DeviceOnline(device) => {
            println!(
                "\x1b[1;32m⇅\x1b[0m Online: \x1b[1m{}\x1b[0m ({})",
                device.display_name, device.uuid
            );
        }
        LinkEvent::DeviceOffline(uuid) => {
            println!("\x1b[1;31m⬤\x1b[0m Offline: {}", uuid);
        }
        LinkEvent::PairingRequest { uuid, display_name } => {
            println!(
                "\x1b[1;35m⚡\x1b[0m Pairing request from \x1b[1m{}\x1b[0m ({})",
                display_name, uuid
            );
            // No interactive prompt here: accept immediately so the demo
            // flow works; real front-ends gate this on user input.
            match service.approve_peer(uuid).await {
                Ok(()) => println!("    accepted"),
                Err(e) => eprintln!("    approval failed: {e}"),
            }
        }
        LinkEvent::Paired(device) => {
            println!(
                "\x1b[1;35m⚡\x1b[0m Paired with \x1b[1m{}\x1b[0m ({})",
                device.display_name, device.uuid
            );
        }
        LinkEvent::Notification { from, payload } => {
            let title = payload
                .get("title")
                .and_then(|v| v.as_str())
                .unwrap_or("(untitled)");
            println!("\x1b[1;34m🔔\x1b[0m {} from {}", title, from);
        }
        LinkEvent::Clipboard { from, .. } => {
            println!("\x1b[1;34m📋\x1b[0m Clipboard from {}", from);
        }
        LinkEvent::SuperIsland { from, .. } => {
            println!("\x1b[1;34m◉\x1b[0m Island update from {}", from);
        }
        LinkEvent::MediaPlay { from, .. } | LinkEvent::MediaControl { from, .. } => {
            println!("\x1b[1;34m♪\x1b[0m Media event from {}", from);
        }
        LinkEvent::Status { from, .. } => {
            println!("\x1b[2m·\x1b[0m Status from {}", from);
        }
        LinkEvent::FileTransfer { from, .. } => {
            println!("\x1b[1;34m⇪\x1b[0m File-transfer control from {}", from);
        }
        LinkEvent::IconsUpdated { from, packages } => {
            println!(
                "\x1b[1;34m▣\x1b[0m {} icon(s) from {}",
                packages.len(),
                from
            );
        }
        LinkEvent::AppListUpdated { from, count } => {
            println!("\x1b[1;34m▤\x1b[0m {} app(s) listed by {}", count, from);
        }
    }
}
