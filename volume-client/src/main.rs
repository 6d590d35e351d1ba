//! volume-lifecycle
//!
//! Command-line front end for the volume registry and the host-side client.
//! Every subcommand prints its result as JSON on stdout; logs go to stderr.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use volume_agent::poll::DEFAULT_POLL_INTERVAL;
use volume_agent::{
    ApiSettings, MetadataOnly, Owner, PollSettings, ProvisioningBackend, VolumeApi, VolumeId,
    VolumeRegistry, VolumeStatus, ZfsBackend, ZfsManager, poll_until,
};
use volume_client::types::parse_portals;
use volume_client::{
    DevicePath, DriverKind, FsType, IscsiDriver, IscsiSettings, LifecycleStory, MemoryDriver,
    StorageDriver, StoryConfig, VolumeClient,
};

#[derive(Parser, Debug)]
#[command(name = "volume-lifecycle")]
#[command(about = "Create, attach, format and delete block storage volumes")]
struct Cli {
    #[command(flatten)]
    args: Args,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug)]
struct Args {
    /// Storage driver (memory, iscsi)
    #[arg(long, env = "VOLUME_DRIVER", default_value = "memory", global = true)]
    driver: DriverKind,

    /// Compute host name volumes are assigned to (defaults to this machine)
    #[arg(long, env = "VOLUME_HOST", global = true)]
    host: Option<String>,

    /// Registry state file; without it the registry lives for this run only
    #[arg(long, env = "VOLUME_STATE_FILE", global = true)]
    state_file: Option<PathBuf>,

    /// Directory the story mounts volumes under
    #[arg(long, env = "VOLUME_MOUNT_ROOT", global = true)]
    mount_root: Option<PathBuf>,

    /// Base iSCSI IQN (e.g., iqn.2024-01.com.example.storage)
    #[arg(long, env = "ISCSI_BASE_IQN", default_value = "iqn.2024-01.org.example.volumes", global = true)]
    base_iqn: String,

    /// Comma-separated iSCSI portals (host[:port]); several enable multipath
    #[arg(long, env = "ISCSI_PORTAL", default_value = "127.0.0.1:3260", global = true)]
    portal: String,

    /// Filesystem written by format (ext4, xfs)
    #[arg(long, env = "VOLUME_FS_TYPE", default_value = "ext4", global = true)]
    fs_type: FsType,

    /// ZFS parent dataset; when set, volumes are backed by zvols
    #[arg(long, env = "ZFS_PARENT", global = true)]
    zfs_parent: Option<String>,

    /// Artificial delay before provisioning starts, in milliseconds
    #[arg(long, env = "PROVISION_DELAY_MS", default_value = "0", global = true)]
    provision_delay_ms: u64,

    /// After `delete`, wait this many seconds and purge the record
    #[arg(long, env = "PURGE_AFTER_SECS", global = true)]
    purge_after_secs: Option<u64>,

    /// How long to wait for status changes, in seconds
    #[arg(long, env = "POLL_TIMEOUT_SECS", default_value = "60", global = true)]
    poll_timeout_secs: u64,

    #[arg(long, env = "VOLUME_USER_ID", default_value = "admin", global = true)]
    user_id: String,

    #[arg(long, env = "VOLUME_PROJECT_ID", default_value = "admin", global = true)]
    project_id: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Prometheus metrics HTTP address (e.g., 0.0.0.0:9091)
    /// If not set, metrics endpoint is disabled
    #[arg(long, env = "METRICS_ADDR", global = true)]
    metrics_addr: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a volume and wait until it is available
    Create {
        /// Size in GiB
        #[arg(long, default_value = "1")]
        size: u64,
        #[arg(long, default_value = "")]
        name: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    Get {
        id: VolumeId,
    },
    /// List this user's volumes
    List,
    Delete {
        id: VolumeId,
    },
    /// Drop soft-deleted records
    Purge,
    /// Assign a volume to the host
    Assign {
        id: VolumeId,
    },
    /// Attach an assigned volume and print its device
    Setup {
        id: VolumeId,
    },
    /// Format the volume unless it already has a filesystem
    Initialize {
        id: VolumeId,
    },
    Mount {
        device: DevicePath,
        mount_point: PathBuf,
    },
    Unmount {
        mount_point: PathBuf,
    },
    /// Print the filesystem UUID of a device
    Fingerprint {
        device: DevicePath,
    },
    /// Detach a volume and release it from the host
    Remove {
        id: VolumeId,
    },
    /// Run the full create-to-delete lifecycle once
    Story,
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let Cli { args, command } = Cli::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(ref addr_str) = args.metrics_addr {
        let addr = addr_str
            .parse()
            .map_err(|e| format!("Invalid metrics address '{}': {}", addr_str, e))?;
        if let Err(e) = volume_agent::metrics::init_metrics(addr) {
            return Err(format!("Failed to initialize metrics: {}", e).into());
        }
    }

    let host = match args.host {
        Some(ref host) => host.clone(),
        None => hostname::get()?.to_string_lossy().to_string(),
    };
    let owner = Owner::new(&args.user_id, &args.project_id);
    let poll = PollSettings::new(
        Duration::from_secs(args.poll_timeout_secs),
        DEFAULT_POLL_INTERVAL,
    );

    info!(driver = %args.driver, host = %host, "Starting volume-lifecycle");

    let registry = match args.state_file {
        Some(ref path) => {
            info!(state_file = %path.display(), "Loading registry state");
            VolumeRegistry::open(path).await?
        }
        None => VolumeRegistry::new(),
    };

    let backend: Arc<dyn ProvisioningBackend> = match args.zfs_parent {
        Some(ref parent) => Arc::new(ZfsBackend::new(ZfsManager::new(parent.clone())?)),
        None => Arc::new(MetadataOnly),
    };

    let api = Arc::new(VolumeApi::new(
        Arc::new(registry),
        backend,
        ApiSettings {
            provision_delay: Duration::from_millis(args.provision_delay_ms),
            // the process exits after one command, so retention is waited out inline
            purge_after: None,
        },
    ));

    let driver: Arc<dyn StorageDriver> = match args.driver {
        DriverKind::Memory => Arc::new(MemoryDriver::new()),
        DriverKind::Iscsi => Arc::new(IscsiDriver::new(
            IscsiSettings::new(&args.base_iqn, parse_portals(&args.portal))
                .with_fs_type(args.fs_type),
        )?),
    };
    let client = VolumeClient::new(driver, Arc::clone(&api), host);

    match command {
        Command::Create {
            size,
            name,
            description,
        } => {
            let volume = api.create(&owner, size, &name, &description).await?;
            // provisioning runs in this process, so wait for it before exiting
            let volume = poll_until(
                || api.get(volume.id),
                |v| v.status != VolumeStatus::Creating,
                poll,
            )
            .await?;
            print_json(&volume)?;
        }
        Command::Get { id } => print_json(&api.get(id).await?)?,
        Command::List => print_json(&api.list(&owner).await)?,
        Command::Delete { id } => {
            api.delete(id).await?;
            print_json(&api.get(id).await?)?;
            if let Some(secs) = args.purge_after_secs {
                info!(volume_id = %id, retention_secs = secs, "Waiting to purge deleted volume");
                tokio::time::sleep(Duration::from_secs(secs)).await;
                api.purge(id).await?;
                info!(volume_id = %id, "Purged deleted volume");
            }
        }
        Command::Purge => print_json(&api.purge_deleted().await?)?,
        Command::Assign { id } => print_json(&client.assign_to_host(id).await?)?,
        Command::Setup { id } => print_json(&client.setup_volume(id).await?)?,
        Command::Initialize { id } => print_json(&client.initialize(id).await?)?,
        Command::Mount {
            device,
            mount_point,
        } => {
            client.mount(&device, &mount_point).await?;
            print_json(&mount_point)?;
        }
        Command::Unmount { mount_point } => {
            client.unmount(&mount_point).await?;
            print_json(&mount_point)?;
        }
        Command::Fingerprint { device } => print_json(&client.get_fingerprint(&device).await?)?,
        Command::Remove { id } => print_json(&client.remove_volume(id).await?)?,
        Command::Story => {
            let mount_root = args
                .mount_root
                .unwrap_or_else(|| std::env::temp_dir().join("volume-lifecycle"));
            let mut config = StoryConfig::new(owner, mount_root);
            config.poll = poll;
            let report = LifecycleStory::new(Arc::clone(&api), client, config)
                .run()
                .await?;
            print_json(&report)?;
        }
    }

    Ok(())
}
