//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The directory under the user's home where nimbus stores its state by default.
pub const NIMBUS_HOME_DIR: &str = ".nimbus";

/// The sub directory where per-sandbox ephemeral root filesystems and logs are kept.
pub const SANDBOXES_SUBDIR: &str = "sandboxes";

/// The sub directory where volume data is stored.
pub const VOLUMES_SUBDIR: &str = "volumes";

/// The sub directory where template snapshot generations are stored.
pub const TEMPLATES_SUBDIR: &str = "templates";

/// The sub directory where template build VMs keep their scratch filesystems.
pub const BUILDS_SUBDIR: &str = "builds";

/// The catalog database filename.
pub const NIMBUS_DB_FILENAME: &str = "nimbus.db";

/// The configuration filename looked up in the home directory.
pub const NIMBUS_CONFIG_FILENAME: &str = "nimbus.toml";

/// The directory inside a sandbox root that holds its guest filesystem.
pub const ROOTFS_SUBDIR: &str = "rootfs";
