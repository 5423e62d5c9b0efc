use serde::Deserialize;
use std::path::Path;

#[derive(Deserialize, Debug, Clone)]
pub struct DaqConfig {
    #[serde(default = "defaults::port")]
    pub port: u16,
    /// Sender hostname, or "any" to accept all peers.
    #[serde(default = "defaults::sender")]
    pub sender: String,
    /// Expected datagram size in bytes; fixes the packet format.
    #[serde(default = "defaults::packet_size")]
    pub packet_size: usize,
    #[serde(default = "defaults::input_databuf")]
    pub input_databuf: u32,
    #[serde(default = "defaults::output_databuf")]
    pub output_databuf: u32,
    #[serde(default = "defaults::n_block")]
    pub n_block: usize,
    #[serde(default = "defaults::block_size")]
    pub block_size: usize,
    #[serde(default = "defaults::header_size")]
    pub header_size: usize,
    #[serde(default = "defaults::nbin")]
    pub nbin: usize,
    /// Integration span in seconds of observed MJD.
    #[serde(default = "defaults::tfold_sec")]
    pub tfold_sec: f64,
    #[serde(default = "defaults::nthread")]
    pub nthread: usize,
    /// CPU the capture thread is pinned to; omit to leave it floating.
    #[serde(default = "defaults::capture_cpu")]
    pub capture_cpu: Option<usize>,
    #[serde(default = "defaults::shm_dir")]
    pub shm_dir: String,
    #[serde(default = "defaults::polyco_path")]
    pub polyco_path: String,
    /// VDIF frames per UTC second; only the VDIF format reads this.
    #[serde(default = "defaults::packets_per_sec")]
    pub packets_per_sec: u32,
    #[serde(default)]
    pub observation: ObservationConfig,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ObservationConfig {
    #[serde(default = "defaults::src_name")]
    pub src_name: String,
    #[serde(default = "defaults::stt_imjd")]
    pub stt_imjd: i64,
    #[serde(default = "defaults::stt_smjd")]
    pub stt_smjd: f64,
    /// Seconds per time sample.
    #[serde(default = "defaults::tbin")]
    pub tbin: f64,
    #[serde(default = "defaults::nchan")]
    pub nchan: i64,
    #[serde(default = "defaults::npol")]
    pub npol: i64,
    #[serde(default = "defaults::acc_len")]
    pub acc_len: i64,
}

impl Default for ObservationConfig {
    fn default() -> Self {
        Self {
            src_name: defaults::src_name(),
            stt_imjd: defaults::stt_imjd(),
            stt_smjd: defaults::stt_smjd(),
            tbin: defaults::tbin(),
            nchan: defaults::nchan(),
            npol: defaults::npol(),
            acc_len: defaults::acc_len(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),
}

mod defaults {
    pub fn port() -> u16 {
        50000
    }
    pub fn sender() -> String {
        "any".into()
    }
    pub fn packet_size() -> usize {
        8208
    }
    pub fn input_databuf() -> u32 {
        1
    }
    pub fn output_databuf() -> u32 {
        2
    }
    pub fn n_block() -> usize {
        24
    }
    pub fn block_size() -> usize {
        32 * 1024 * 1024
    }
    pub fn header_size() -> usize {
        16 * 1024
    }
    pub fn nbin() -> usize {
        256
    }
    pub fn tfold_sec() -> f64 {
        60.0
    }
    pub fn nthread() -> usize {
        4
    }
    pub fn capture_cpu() -> Option<usize> {
        Some(3)
    }
    pub fn shm_dir() -> String {
        "/dev/shm".into()
    }
    pub fn polyco_path() -> String {
        "polyco.dat".into()
    }
    pub fn packets_per_sec() -> u32 {
        25600
    }
    pub fn src_name() -> String {
        "B0833-45".into()
    }
    pub fn stt_imjd() -> i64 {
        61048
    }
    pub fn stt_smjd() -> f64 {
        0.0
    }
    pub fn tbin() -> f64 {
        40.96e-6
    }
    pub fn nchan() -> i64 {
        2048
    }
    pub fn npol() -> i64 {
        2
    }
    pub fn acc_len() -> i64 {
        16
    }
}

impl DaqConfig {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        let toml_to_str = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        let config: DaqConfig = toml::from_str(&toml_to_str)?;
        Ok(config)
    }

    /// All-defaults configuration for running without a file.
    pub fn defaults() -> Self {
        toml::from_str("").expect("empty config deserializes from defaults")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_all_defaults() {
        let cfg = DaqConfig::defaults();
        assert_eq!(cfg.port, 50000);
        assert_eq!(cfg.sender, "any");
        assert_eq!(cfg.packet_size, 8208);
        assert_eq!(cfg.n_block, 24);
        assert_eq!(cfg.block_size, 32 * 1024 * 1024);
        assert_eq!(cfg.nthread, 4);
        assert_eq!(cfg.observation.nchan, 2048);
    }

    #[test]
    fn partial_file_overrides_only_named_keys() {
        let cfg: DaqConfig = toml::from_str(
            r#"
            port = 60100
            sender = "sampler0"
            tfold_sec = 30.0

            [observation]
            src_name = "J0437-4715"
            nchan = 512
            "#,
        )
        .unwrap();
        assert_eq!(cfg.port, 60100);
        assert_eq!(cfg.sender, "sampler0");
        assert!((cfg.tfold_sec - 30.0).abs() < f64::EPSILON);
        assert_eq!(cfg.observation.src_name, "J0437-4715");
        assert_eq!(cfg.observation.nchan, 512);
        // Untouched keys keep their defaults.
        assert_eq!(cfg.packet_size, 8208);
        assert_eq!(cfg.observation.npol, 2);
    }
}
