//! Info command implementation.

use lanlink_core::discovery::{get_local_ips, IfAddrClassifier, NetworkClassifier};
use lanlink_core::protocol::DeviceType;
use lanlink_core::{Config, LanlinkService};

/// Display device information.
pub fn show_info(
    device_name: String,
    device_type: DeviceType,
    config: Config,
) -> anyhow::Result<()> {
    let service = LanlinkService::with_config(device_name, device_type, config)?;

    println!("\n\x1b[1mLanlink Device Info\x1b[0m");
    println!("═══════════════════════════════════════");
    println!("\x1b[1mName:\x1b[0m        {}", service.device_name());
    println!("\x1b[1mID:\x1b[0m          {}", service.device_id());
    println!("\x1b[1mFingerprint:\x1b[0m {}", service.fingerprint());
    println!("\x1b[1mNetwork:\x1b[0m     {:?}", IfAddrClassifier.classify());

    println!("\n\x1b[1mLocal IPs:\x1b[0m");
    for ip in get_local_ips() {
        println!("  • {}", ip);
    }
    println!();
    Ok(())
}
