use std::{
    env,
    process::{self, Command},
};

/// Launches the kernel's UEFI disk image under QEMU with OVMF firmware.
///
/// This is the default way to boot the kernel during development: cargo's
/// `kernel` artifact dependency in `build.rs` produces a raw UEFI disk image,
/// and this binary just wires that image and a prebuilt OVMF firmware blob
/// into a `qemu-system-x86_64` invocation.
fn main() {
    let ovmf = ovmf_prebuilt::Prebuilt::fetch(ovmf_prebuilt::Source::LATEST, "target/ovmf")
        .expect("failed to fetch prebuilt OVMF firmware");

    let mut qemu = Command::new("qemu-system-x86_64");
    qemu.arg("-drive");
    qemu.arg(format!(
        "if=pflash,format=raw,readonly=on,file={}",
        ovmf.get_file(ovmf_prebuilt::Arch::X64, ovmf_prebuilt::FileType::Code)
            .display()
    ));
    qemu.arg("-drive");
    qemu.arg(format!(
        "if=pflash,format=raw,file={}",
        ovmf.get_file(ovmf_prebuilt::Arch::X64, ovmf_prebuilt::FileType::Vars)
            .display()
    ));
    qemu.arg("-drive");
    qemu.arg(format!("format=raw,file={}", env!("UEFI_IMAGE")));

    if let Ok(log_path) = env::var("COREOS_QEMU_LOG_PATH") {
        let debug_flags =
            env::var("COREOS_QEMU_DEBUG_FLAGS").unwrap_or_else(|_| "guest_errors".to_string());
        qemu.args(["-d", &debug_flags, "-D", &log_path]);
        eprintln!("[qemu-uefi] Debug log: {} (flags: {})", log_path, debug_flags);
    }

    let extra_args: Vec<String> = env::args().skip(1).collect();
    if !extra_args.is_empty() {
        eprintln!("[qemu-uefi] Extra args: {:?}", extra_args);
        qemu.args(&extra_args);
    }

    let exit_status = qemu.status().unwrap();
    process::exit(exit_status.code().unwrap_or(-1));
}
