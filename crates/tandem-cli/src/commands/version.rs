//! `tandem version`: build and wire protocol details.
//!
//! Nodes and the view service only interoperate when they agree on the
//! frame layout and the message codes, so both are printed here.

use tandem_wire::{FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE, MessageKind};

pub fn run() {
    println!(
        "{} {} ({} {})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH,
    );
    println!();

    println!("Wire protocol:");
    println!("  Frame header: {FRAME_HEADER_SIZE} bytes, [type:4][length:4], big-endian");
    println!("  Max payload:  {} MiB", MAX_PAYLOAD_SIZE / (1024 * 1024));
    println!("  Messages:");
    for kind in MessageKind::ALL {
        println!("    {:>2}  {}", kind.as_u32(), kind.name());
    }
}
