//! Command line and environment configuration.
//!
//! Every flag has a `ZONECLAIM_*` environment fallback so the binary can be
//! driven from a unit file or a launch template without arguments.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use zoneclaim_id::NodeId;
use zoneclaim_reconcile::{PollConfig, RetryPolicy};

use crate::disk::VolumeLayout;
use crate::error::ProvisionError;
use crate::lease::LeasePolicy;
use crate::logging::LogFormat;
use crate::model::{InterfaceParams, ResourceKind, ResourceParams, VolumeParams};
use crate::tags::TagKeys;

/// Volume types the provider accepts.
const VOLUME_TYPES: &[&str] = &["gp2", "gp3", "io1", "io2"];

/// zoneclaim - claim and attach zone-pinned resources at node boot.
#[derive(Debug, Parser)]
#[command(name = "zoneclaim")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log output format.
    #[arg(long, global = true, env = "ZONECLAIM_LOG_FORMAT", value_enum, default_value = "json")]
    pub log_format: LogFormat,

    /// Default log filter; `RUST_LOG` overrides it.
    #[arg(long, global = true, env = "ZONECLAIM_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Acquire, attach, and prepare this node's resource.
    Provision(Options),

    /// Delete the resource this node holds and forget it.
    Release(Options),
}

impl Command {
    pub fn options(&self) -> &Options {
        match self {
            Command::Provision(options) | Command::Release(options) => options,
        }
    }
}

/// Options shared by every subcommand.
#[derive(Debug, Clone, Args)]
pub struct Options {
    /// This node's instance identifier, used as the lease holder.
    #[arg(long, env = "ZONECLAIM_NODE_ID")]
    pub node_id: String,

    /// Availability zone the node runs in.
    #[arg(long, env = "ZONECLAIM_ZONE")]
    pub zone: String,

    /// Kind of resource to manage.
    #[arg(long, env = "ZONECLAIM_KIND", value_enum)]
    pub kind: ResourceKind,

    /// Provider gateway URL.
    #[arg(long, env = "ZONECLAIM_BACKEND_URL", default_value = "http://127.0.0.1:8080")]
    pub backend_url: String,

    /// Per-request timeout for the provider gateway.
    #[arg(long, env = "ZONECLAIM_BACKEND_TIMEOUT_SECS", default_value_t = 30)]
    pub backend_timeout_secs: u64,

    /// Where the claimed resource id is recorded.
    #[arg(long, env = "ZONECLAIM_STATE_FILE", default_value = "/var/lib/zoneclaim/state.json")]
    pub state_file: PathBuf,

    /// Seconds after which another node's unrenewed lease may be taken over.
    #[arg(long, env = "ZONECLAIM_LEASE_TIMEOUT_SECS", default_value_t = 600)]
    pub lease_timeout_secs: u64,

    /// Seconds between state polls.
    #[arg(long, env = "ZONECLAIM_POLL_INTERVAL_SECS", default_value_t = 5)]
    pub poll_interval_secs: u64,

    /// Deadline for each convergence wait.
    #[arg(long, env = "ZONECLAIM_ATTACH_TIMEOUT_SECS", default_value_t = 300)]
    pub attach_timeout_secs: u64,

    /// Sleep a random number of seconds below this before starting.
    #[arg(long, env = "ZONECLAIM_INITIAL_WAIT_RANDOM_SECONDS", default_value_t = 0)]
    pub initial_wait_random_seconds: u64,

    #[arg(long, env = "ZONECLAIM_ID_TAG_KEY", default_value = "Id")]
    pub id_tag_key: String,

    #[arg(long, env = "ZONECLAIM_ID_TAG_VALUE")]
    pub id_tag_value: Option<String>,

    #[arg(long, env = "ZONECLAIM_KIND_TAG_KEY", default_value = "Kind")]
    pub kind_tag_key: String,

    #[arg(long, env = "ZONECLAIM_KIND_TAG_VALUE")]
    pub kind_tag_value: Option<String>,

    /// Tag key naming the node's pool; matched as a suffix on node tags.
    #[arg(long, env = "ZONECLAIM_POOL_TAG_KEY", default_value = "autoscaling:groupName")]
    pub pool_tag_key: String,

    /// Pool name. Discovered from the node's own tags if omitted.
    #[arg(long, env = "ZONECLAIM_POOL_NAME")]
    pub pool_name: Option<String>,

    #[arg(long, env = "ZONECLAIM_LEASE_TAG_KEY", default_value = "LeaseHold")]
    pub lease_tag_key: String,

    /// If set, tag the node with this key and the claimed resource id.
    #[arg(long, env = "ZONECLAIM_PUBLISH_TAG_KEY")]
    pub publish_tag_key: Option<String>,

    #[arg(long, env = "ZONECLAIM_VOLUME_TYPE", default_value = "gp3")]
    pub volume_type: String,

    #[arg(long, env = "ZONECLAIM_VOLUME_SIZE_GB", default_value_t = 300)]
    pub volume_size_gb: u32,

    #[arg(long, env = "ZONECLAIM_VOLUME_IOPS", default_value_t = 3000)]
    pub volume_iops: u32,

    /// MiB/s.
    #[arg(long, env = "ZONECLAIM_VOLUME_THROUGHPUT", default_value_t = 500)]
    pub volume_throughput: u32,

    #[arg(long, env = "ZONECLAIM_VOLUME_ENCRYPTED", default_value_t = true, action = clap::ArgAction::Set)]
    pub volume_encrypted: bool,

    #[arg(long, env = "ZONECLAIM_DEVICE_NAME", default_value = "/dev/xvdb")]
    pub device_name: String,

    #[arg(long, env = "ZONECLAIM_FILESYSTEM", default_value = "ext4")]
    pub filesystem: String,

    #[arg(long, env = "ZONECLAIM_MOUNT_DIR", default_value = "/data")]
    pub mount_dir: PathBuf,

    #[arg(long, env = "ZONECLAIM_FSTAB", default_value = "/etc/fstab")]
    pub fstab: PathBuf,

    #[arg(long, env = "ZONECLAIM_SUBNET_ID")]
    pub subnet_id: Option<String>,

    #[arg(long, env = "ZONECLAIM_SECURITY_GROUP_IDS", value_delimiter = ',')]
    pub security_group_ids: Vec<String>,

    #[arg(long, env = "ZONECLAIM_DESCRIPTION")]
    pub description: Option<String>,
}

/// Validated provisioner configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Lease holder identity.
    pub node_id: NodeId,
    pub zone: String,
    pub kind: ResourceKind,
    pub backend_url: String,
    pub backend_timeout: Duration,
    pub state_file: PathBuf,
    pub lease: LeasePolicy,
    /// Interval and deadline for resource convergence waits.
    pub poll: PollConfig,
    /// Interval and deadline for pool discovery from node tags.
    pub pool_discovery: PollConfig,
    pub initial_wait: Duration,
    pub tag_keys: TagKeys,
    pub pool_name: Option<String>,
    pub params: ResourceParams,
    pub volume_layout: VolumeLayout,
    pub tag_retry: RetryPolicy,
}

impl Config {
    /// Configuration for `kind` in `zone` with default tuning. Used by
    /// embedders and tests.
    pub fn new(node_id: NodeId, zone: impl Into<String>, kind: ResourceKind) -> Self {
        let params = match kind {
            ResourceKind::Volume => ResourceParams::Volume(VolumeParams::default()),
            ResourceKind::Interface => ResourceParams::Interface(InterfaceParams::default()),
            ResourceKind::Address => ResourceParams::Address,
        };

        Self {
            node_id,
            zone: zone.into(),
            kind,
            backend_url: "http://127.0.0.1:8080".to_string(),
            backend_timeout: Duration::from_secs(30),
            state_file: PathBuf::from("/var/lib/zoneclaim/state.json"),
            lease: LeasePolicy::default(),
            poll: PollConfig::default(),
            pool_discovery: PollConfig::new(Duration::from_secs(10), Duration::from_secs(10 * 60)),
            initial_wait: Duration::ZERO,
            tag_keys: TagKeys::default(),
            pool_name: None,
            params,
            volume_layout: VolumeLayout::default(),
            tag_retry: RetryPolicy::default(),
        }
    }

    /// Validate parsed options.
    pub fn from_cli(options: &Options) -> Result<Self, ProvisionError> {
        let node_id = NodeId::parse(&options.node_id)
            .map_err(|e| ProvisionError::Config(format!("invalid node id: {e}")))?;

        if options.zone.trim().is_empty() {
            return Err(ProvisionError::Config("zone must not be empty".to_string()));
        }
        if options.lease_timeout_secs == 0 {
            return Err(ProvisionError::Config(
                "lease timeout must be positive".to_string(),
            ));
        }
        if options.poll_interval_secs == 0 {
            return Err(ProvisionError::Config(
                "poll interval must be positive".to_string(),
            ));
        }
        if options.attach_timeout_secs < options.poll_interval_secs {
            return Err(ProvisionError::Config(format!(
                "attach timeout ({}s) must not be shorter than the poll interval ({}s)",
                options.attach_timeout_secs, options.poll_interval_secs
            )));
        }

        for (flag, key) in [
            ("--id-tag-key", &options.id_tag_key),
            ("--kind-tag-key", &options.kind_tag_key),
            ("--pool-tag-key", &options.pool_tag_key),
            ("--lease-tag-key", &options.lease_tag_key),
        ] {
            if key.trim().is_empty() {
                return Err(ProvisionError::Config(format!("{flag} must not be empty")));
            }
        }

        let params = match options.kind {
            ResourceKind::Volume => {
                if !VOLUME_TYPES.contains(&options.volume_type.as_str()) {
                    return Err(ProvisionError::Config(format!(
                        "unsupported volume type {:?}, expected one of {}",
                        options.volume_type,
                        VOLUME_TYPES.join(", ")
                    )));
                }
                if options.volume_size_gb == 0 {
                    return Err(ProvisionError::Config(
                        "volume size must be positive".to_string(),
                    ));
                }
                if !options.mount_dir.is_absolute() {
                    return Err(ProvisionError::Config(format!(
                        "mount dir {} must be absolute",
                        options.mount_dir.display()
                    )));
                }
                ResourceParams::Volume(VolumeParams {
                    volume_type: options.volume_type.clone(),
                    size_gb: options.volume_size_gb,
                    iops: options.volume_iops,
                    throughput: options.volume_throughput,
                    encrypted: options.volume_encrypted,
                })
            }
            ResourceKind::Interface => ResourceParams::Interface(InterfaceParams {
                subnet_id: options.subnet_id.clone(),
                security_group_ids: options.security_group_ids.clone(),
                description: options.description.clone(),
            }),
            ResourceKind::Address => ResourceParams::Address,
        };

        let mut config = Self::new(node_id, options.zone.trim(), options.kind);
        config.backend_url = options.backend_url.clone();
        config.backend_timeout = Duration::from_secs(options.backend_timeout_secs);
        config.state_file = options.state_file.clone();
        config.lease = LeasePolicy {
            timeout: Duration::from_secs(options.lease_timeout_secs),
        };
        config.poll = PollConfig::new(
            Duration::from_secs(options.poll_interval_secs),
            Duration::from_secs(options.attach_timeout_secs),
        );
        config.initial_wait = Duration::from_secs(options.initial_wait_random_seconds);
        config.tag_keys = TagKeys {
            id_key: options.id_tag_key.clone(),
            id_value: options.id_tag_value.clone(),
            kind_key: options.kind_tag_key.clone(),
            kind_value: options.kind_tag_value.clone(),
            pool_key: options.pool_tag_key.clone(),
            lease_key: options.lease_tag_key.clone(),
            publish_key: options.publish_tag_key.clone(),
        };
        config.pool_name = options.pool_name.clone().filter(|p| !p.is_empty());
        config.params = params;
        config.volume_layout = VolumeLayout {
            device: options.device_name.clone(),
            filesystem: options.filesystem.clone(),
            mount_dir: options.mount_dir.clone(),
            fstab: options.fstab.clone(),
        };

        Ok(config)
    }
}
