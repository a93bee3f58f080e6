use std::time::Duration;

// -
// Keyspace roots, relative to the configured prefix

pub(crate) const ROOT_GLOBAL: &str = "global-config";
pub(crate) const ROOT_POLICY: &str = "policies";
pub(crate) const ROOT_POLICY_ARCHIVE: &str = "policy-archives";
pub(crate) const ROOT_VOLUME: &str = "volumes";
pub(crate) const ROOT_RUNTIME_OPTIONS: &str = "runtime-policies";
pub(crate) const ROOT_USE_VOLUME: &str = "users/volume";

/// Path to the global configuration under the store prefix.
pub const GLOBAL_CONFIG_NAME: &str = ROOT_GLOBAL;

// -
// Storage defaults

/// Filesystem used when neither the policy nor the request name one.
pub const DEFAULT_FILESYSTEM: &str = "ext4";

/// Supported filesystems and their mkfs command templates.
pub const DEFAULT_FILESYSTEMS: &[(&str, &str)] = &[("ext4", "mkfs.ext4 -m0 %")];

pub const DRIVER_CEPH: &str = "ceph";
pub const DRIVER_NFS: &str = "nfs";

/// `Backend` shorthand expansions as (name, crud, mount, snapshot).
pub(crate) const DEFAULT_DRIVERS: &[(&str, &str, &str, &str)] = &[
    (DRIVER_CEPH, DRIVER_CEPH, DRIVER_CEPH, DRIVER_CEPH),
    (DRIVER_NFS, "", DRIVER_NFS, ""),
];

// -
// Global defaults

pub const DEFAULT_GLOBAL_TTL: Duration = Duration::from_secs(30);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10 * 60);
/// Published timeouts are expressed in multiples of this.
pub const TIMEOUT_FIX_BASE: Duration = Duration::from_secs(60);
/// Published TTLs are expressed in multiples of this.
pub const TTL_FIX_BASE: Duration = Duration::from_secs(1);
pub const DEFAULT_MOUNT_PATH: &str = "/mnt";

// -
// Lock reasons

pub const REASON_CREATE: &str = "Create";
pub const REASON_REMOVE: &str = "Remove";
pub const REASON_MOUNT: &str = "Use";
pub const REASON_SNAPSHOT: &str = "Snapshot";

/// Name fragment of dump archives: `<prefix>_dump_<timestamp>_`.
pub(crate) const DUMP_INFIX: &str = "_dump_";
pub(crate) const DUMP_TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";
