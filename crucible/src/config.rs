use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use dotenvy::dotenv;

#[derive(Debug)]
pub struct Config {
    pub nats_url: String,
    pub firecracker_binary: PathBuf,
    pub kernel_image: PathBuf,
    pub rootfs_dir: PathBuf,
    pub vm: VmConfig,
}

#[derive(Debug)]
pub struct VmConfig {
    pub vcpus: u32,
    pub mem_size_mib: u32,
    pub pool_size: usize,
    pub boot_deadline: Duration,
}

static CONFIG: OnceLock<Config> = OnceLock::new();

impl Config {
    fn init_from_env() -> Config {
        //load dotenv file if it exists
        match dotenv() {
            Err(_) => tracing::debug!("No .env file found, nothing to load"),
            Ok(_) => tracing::info!("Loaded config from .env file"),
        }

        let nats_url = dotenvy::var("NATS_URL").unwrap_or_else(|_| {
            tracing::warn!("No NATS_URL provided, defaulting to nats://localhost:4222");
            "nats://localhost:4222".to_owned()
        });

        let firecracker_binary: PathBuf = dotenvy::var("FIRECRACKER_BINARY")
            .unwrap_or_else(|_| {
                tracing::warn!(
                    "No FIRECRACKER_BINARY provided, defaulting to /home/user/.local/bin/firecracker"
                );
                "/home/user/.local/bin/firecracker".to_owned()
            })
            .into();

        let kernel_image: PathBuf = dotenvy::var("KERNEL_IMAGE")
            .unwrap_or_else(|_| "linux/vmlinux".to_owned())
            .into();

        let rootfs_dir: PathBuf = dotenvy::var("ROOTFS_DIR")
            .unwrap_or_else(|_| "agent".to_owned())
            .into();

        //one warm VM per language unless told otherwise
        let pool_size = dotenvy::var("POOL_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);

        let config = Config {
            nats_url,
            firecracker_binary,
            kernel_image,
            rootfs_dir,
            vm: VmConfig {
                vcpus: 1,
                mem_size_mib: 300,
                pool_size,
                boot_deadline: Duration::from_secs(30),
            },
        };

        tracing::info!("Loaded config from environment!");

        config
    }
}

pub fn get() -> &'static Config {
    CONFIG.get_or_init(Config::init_from_env)
}
