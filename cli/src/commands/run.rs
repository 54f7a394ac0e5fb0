//! Run command implementation.

use omniclip_core::{Config, DiscoveredPeer, OmniclipService, ServiceEvent};

use crate::process::kill_previous_instances;
use crate::ui::{print_banner, print_qr_code};

/// Run the omniclip service.
pub async fn run_service(device_name: String) -> anyhow::Result<()> {
    kill_previous_instances();
    print_banner();

    let service = OmniclipService::new(device_name, Config::default()).await?;

    println!("\x1b[1mDevice:\x1b[0m {}", service.device_name());
    println!("\x1b[1mID:\x1b[0m     {}", service.device_id());
    println!("\x1b[1mKey:\x1b[0m    {}", service.fingerprint());

    let host_address = omniclip_core::discovery::get_local_ips()
        .into_iter()
        .next()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let (_svg, qr) = service.begin_pairing_as_host(host_address).await?;
    let pairing_url = qr.to_url();

    println!("\n\x1b[1;33mScan this QR code with the Omniclip companion app to pair:\x1b[0m\n");
    print_qr_code(&pairing_url);
    println!("\n\x1b[2mOr enter manually: {}\x1b[0m\n", pairing_url);

    let mut events = service.start().await?;

    println!("\x1b[1;32m✓\x1b[0m Listening for devices and clipboard changes...");
    println!("\x1b[2mPress Ctrl+C to stop.\x1b[0m\n");

    // Handle Ctrl+C gracefully
    let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(1);
    ctrlc::set_handler(move || {
        let _ = tx.blocking_send(());
    })?;

    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                handle_event(event);
            }
            _ = rx.recv() => {
                println!("\n\x1b[1;33mShutting down...\x1b[0m");
                break;
            }
        }
    }

    Ok(())
}

/// Handle a service event and print appropriate output.
fn handle_event(event: ServiceEvent) {
    match event {
        ServiceEvent::DeviceDiscovered(peer) => print_discovered(&peer),
        ServiceEvent::DeviceLost(name) => {
            println!("\x1b[1;31m⬤\x1b[0m Lost: {}", name);
        }
        ServiceEvent::ClipboardReceived { from_device } => {
            println!("\x1b[1;34m📋\x1b[0m Received clipboard update from {}", from_device);
        }
        ServiceEvent::Error(e) => {
            eprintln!("\x1b[1;31m✗\x1b[0m Error: {}", e);
        }
    }
}

fn print_discovered(peer: &DiscoveredPeer) {
    println!(
        "\x1b[1;32m⬤\x1b[0m Found: \x1b[1m{}\x1b[0m ({}:{})",
        peer.service_name, peer.host, peer.port
    );
}
