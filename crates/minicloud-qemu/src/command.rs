//! QEMU command-line construction.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;

use crate::vm::VmSpec;

const BASE_CMD: &str = "qemu-system-x86_64";

// The machine starts paused (-S); the created hook resumes it through the
// monitor once the control plane has registered it.
const BASE_OPTIONS: &[&str] = &[
    "-S",
    "-no-user-config",
    "-nodefaults",
    "-global",
    "kvm-pit.lost_tick_policy=discard",
    "-global",
    "PIIX4_PM.disable_s3=1",
    "-global",
    "PIIX4_PM.disable_s4=1",
    "-machine",
    "pc,accel=kvm,usb=off,vmport=off,mem-merge=off",
    "-rtc",
    "base=utc,clock=host,driftfix=none",
    "-no-shutdown",
    "-boot",
    "strict=on",
    "-vga",
    "std",
    "-cpu",
    "host",
];

/// The name of the QMP socket inside a VM's working directory.
pub const MONITOR_SOCKET: &str = "mon.sock";

/// Builds the QEMU invocation for a VM rooted at `root`.
#[must_use]
pub fn build(spec: &VmSpec, root: &Path) -> Command {
    let mut cmd = Command::new(BASE_CMD);
    cmd.args(BASE_OPTIONS);

    let monitor_path = root.join(MONITOR_SOCKET);
    cmd.arg("-chardev").arg(format!(
        "socket,id=charmon,path={},server=on,wait=off",
        monitor_path.display()
    ));
    cmd.arg("-mon").arg("chardev=charmon,mode=control");

    cmd.arg("-uuid").arg(spec.id.to_uuid_string());
    cmd.arg("-smp").arg(spec.num_cpus.to_string());
    cmd.arg("-m").arg(spec.ram_mb.to_string());
    cmd.arg("-vnc").arg(format!("0.0.0.0:{}", spec.vnc_port));

    for disk in &spec.disks {
        cmd.arg("-drive").arg(format!(
            "format=rbd,file=rbd:{}/{},if=virtio,discard=on,cache={}",
            disk.pool, disk.disk, disk.cache
        ));
    }

    cmd.stdin(Stdio::null());
    cmd.kill_on_drop(true);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{DiskCache, VmDisk};
    use minicloud_core::ServerId;

    #[test]
    fn command_carries_machine_shape() {
        let spec = VmSpec {
            id: ServerId::generate(),
            num_cpus: 2,
            ram_mb: 2048,
            vnc_port: 3,
            disks: vec![VmDisk {
                pool: "vols".into(),
                disk: "d1".into(),
                cache: DiskCache::WriteBack,
            }],
        };
        let cmd = build(&spec, Path::new("/var/lib/minicloud/vm"));
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert!(args.contains(&"-S".to_string()));
        assert!(args.contains(&"2".to_string()));
        assert!(args.contains(&"2048".to_string()));
        assert!(args
            .iter()
            .any(|a| a.contains("rbd:vols/d1") && a.contains("cache=writeback")));
        assert!(args.iter().any(|a| a.contains("mon.sock")));
        assert!(args.contains(&spec.id.to_uuid_string()));
    }
}
