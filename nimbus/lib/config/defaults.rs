use std::net::{IpAddr, Ipv4Addr, SocketAddr};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The default number of vCPUs given to a sandbox.
pub const DEFAULT_VCPUS: u32 = 2;

/// The default amount of memory in MiB given to a sandbox.
pub const DEFAULT_MEMORY_MIB: u64 = 512;

/// The default disk allocation in MiB given to a sandbox.
pub const DEFAULT_DISK_MIB: u64 = 1024;

/// The default port for the HTTP server.
pub const DEFAULT_SERVER_PORT: u16 = 7470;

/// The default server address.
pub const DEFAULT_SERVER_ADDR: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_SERVER_PORT);

/// The default public domain sandbox hosts are published under.
pub const DEFAULT_DOMAIN: &str = "nimbus.localhost";

/// The guest path prefixes a volume may be mounted under.
pub const DEFAULT_ALLOWED_MOUNT_PREFIXES: [&str; 4] = ["/workspace", "/data", "/mnt", "/volumes"];

/// How often the expiry sweep runs.
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 250;

/// How long a micro-VM may take to become ready.
pub const DEFAULT_PROVISIONING_TIMEOUT_MS: u64 = 60_000;

/// How often readiness checks are polled.
pub const DEFAULT_READY_CHECK_INTERVAL_MS: u64 = 100;

/// How long a readiness check may keep failing before start-up is considered failed.
pub const DEFAULT_READY_CHECK_TIMEOUT_MS: u64 = 30_000;

/// The sandbox lifetime used when a create request does not set one.
pub const DEFAULT_SANDBOX_TIMEOUT_SECS: u64 = 300;

/// The longest lifetime a sandbox may be given.
pub const DEFAULT_MAX_SANDBOX_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// Requests per second allowed per team by the REST layer. `0` disables limiting.
pub const DEFAULT_RATE_LIMIT_PER_SEC: u32 = 100;

/// The chunk size used when streaming file reads.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 64 * 1024;

/// The default vCPUs for template build VMs.
pub const DEFAULT_BUILD_VCPUS: u32 = 2;

/// The default memory in MiB for template build VMs.
pub const DEFAULT_BUILD_MEMORY_MIB: u64 = 1024;

/// The guest user commands run as when none is given.
pub const DEFAULT_GUEST_USER: &str = "user";

/// The team used when the server runs without authentication and no team header is sent.
pub const DEFAULT_TEAM: &str = "default";

/// The alias of the built-in template every team can use.
pub const BASE_TEMPLATE_ALIAS: &str = "base";

/// The working directory commands start in when none is given.
pub const DEFAULT_WORKDIR: &str = "/home/user";
