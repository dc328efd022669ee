//! Kernel configuration overlay.
//!
//! An overlay is an ordered list of `CONFIG_*` assignments appended to the
//! baseline `.config`. Entries come from three sources, merged in this order:
//! the built-in set below, `kernel.overlay_files` fragments, and the
//! `[kernel.overlay]` table. A later source replaces the value of an existing
//! name in place, so the emitted order stays stable across runs.

use std::fs;
use std::path::Path;

use crate::error::{Error, ErrorKind, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayEntry {
    pub name: String,
    pub value: String,
}

impl OverlayEntry {
    pub fn line(&self) -> String {
        format!("{}={}", self.name, self.value)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overlay {
    entries: Vec<OverlayEntry>,
}

impl Overlay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace. Replacing keeps the entry's original position.
    pub fn set(&mut self, name: &str, value: &str) -> Result<()> {
        let name = name.trim();
        validate_name(name)?;
        validate_value(name, value)?;
        match self.entries.iter_mut().find(|e| e.name == name) {
            Some(existing) => existing.value = value.to_string(),
            None => self.entries.push(OverlayEntry {
                name: name.to_string(),
                value: value.to_string(),
            }),
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.value.as_str())
    }

    pub fn entries(&self) -> &[OverlayEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The lines appended to `.config`, newline terminated.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for e in &self.entries {
            out.push_str(&e.line());
            out.push('\n');
        }
        out
    }

    /// Merge a kconfig fragment: `NAME=value` lines and `# NAME is not set`.
    pub fn merge_fragment(&mut self, text: &str) -> Result<usize> {
        let mut n = 0usize;
        for (i, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix('#') {
                if let Some(name) = rest.trim().strip_suffix(" is not set") {
                    self.set(name.trim(), "n")?;
                    n += 1;
                }
                continue;
            }
            let Some((name, value)) = line.split_once('=') else {
                return Err(Error::new(
                    ErrorKind::Config,
                    format!("overlay fragment line {}: expected NAME=value, got '{line}'", i + 1),
                ));
            };
            self.set(name, value.trim())?;
            n += 1;
        }
        Ok(n)
    }

    pub fn merge_fragment_file(&mut self, path: &Path) -> Result<usize> {
        let text = fs::read_to_string(path).map_err(|e| {
            Error::new(
                ErrorKind::Config,
                format!("failed to read overlay file {}: {e}", path.display()),
            )
        })?;
        self.merge_fragment(&text)
            .map_err(|e| e.context(path.display().to_string()))
    }

    /// `[kernel.overlay]` values: strings as-is, booleans as `y`/`n`, integers
    /// in decimal.
    pub fn set_toml(&mut self, name: &str, value: &toml::Value) -> Result<()> {
        let v = match value {
            toml::Value::String(s) => s.clone(),
            toml::Value::Boolean(true) => "y".into(),
            toml::Value::Boolean(false) => "n".into(),
            toml::Value::Integer(i) => i.to_string(),
            _ => {
                return Err(Error::new(
                    ErrorKind::Config,
                    format!("kernel.overlay.{name} supports only string/bool/integer values"),
                ));
            }
        };
        self.set(name, &v)
    }

    /// Entries whose value did not survive normalization of `final_config`.
    pub fn unrealized<'a>(&'a self, final_config: &str) -> Vec<&'a OverlayEntry> {
        self.entries
            .iter()
            .filter(|e| !is_realized(final_config, &e.name, &e.value))
            .collect()
    }
}

fn validate_name(name: &str) -> Result<()> {
    let valid = name.starts_with("CONFIG_")
        && name.len() > "CONFIG_".len()
        && name
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::new(
            ErrorKind::Config,
            format!("invalid overlay option name '{name}' (expected CONFIG_[A-Z0-9_]+)"),
        ))
    }
}

fn validate_value(name: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::new(
            ErrorKind::Config,
            format!("overlay option {name} has an empty value"),
        ));
    }
    if value.contains('\n') || value.contains('\r') {
        return Err(Error::new(
            ErrorKind::Config,
            format!("overlay option {name} value must be a single line"),
        ));
    }
    Ok(())
}

fn is_realized(cfg: &str, name: &str, want: &str) -> bool {
    let prefix = format!("{name}=");
    let unset = format!("# {name} is not set");
    let mut actual: Option<&str> = None;
    for line in cfg.lines() {
        if let Some(v) = line.strip_prefix(&prefix) {
            actual = Some(v);
        } else if line == unset {
            actual = Some("n");
        }
    }
    match (want, actual) {
        ("n", None) => true,
        (w, Some(a)) => w == a,
        _ => false,
    }
}

/// Settings applied to every build unless `kernel.builtin_overlay = false`.
const BUILTIN: &[(&str, &str)] = &[
    ("CONFIG_LOCALVERSION", "\"-kforge\""),
    ("CONFIG_IPV6", "y"),
    ("CONFIG_DYNAMIC_DEBUG", "y"),
    // thermals
    ("CONFIG_ACPI_THERMAL", "y"),
    ("CONFIG_THERMAL", "y"),
    ("CONFIG_MLXSW_CORE_THERMAL", "y"),
    ("CONFIG_THERMAL_NETLINK", "y"),
    ("CONFIG_INTEL_HFI_THERMAL", "y"),
    ("CONFIG_DEVFREQ_THERMAL", "y"),
    ("CONFIG_INTEL_TH_ACPI", "y"),
    ("CONFIG_X86_PKG_TEMP_THERMAL", "y"),
    // squashfs root
    ("CONFIG_SQUASHFS", "y"),
    ("CONFIG_SQUASHFS_FILE_CACHE", "y"),
    ("CONFIG_SQUASHFS_DECOMP_MULTI_PERCPU", "y"),
    ("CONFIG_SQUASHFS_ZLIB", "y"),
    ("CONFIG_SQUASHFS_FRAGMENT_CACHE_SIZE", "3"),
    // HDMI console: efifb works where simpledrm does not
    ("CONFIG_DRM_SIMPLEDRM", "n"),
    ("CONFIG_X86_SYSFB", "n"),
    ("CONFIG_FB", "y"),
    ("CONFIG_FB_EFI", "y"),
    ("CONFIG_FB_SIMPLE", "y"),
    ("CONFIG_FUSE_FS", "y"),
    // netlink
    ("CONFIG_NETFILTER_NETLINK_QUEUE", "y"),
    ("CONFIG_XFRM_USER", "y"),
    // nftables
    ("CONFIG_NF_TABLES", "y"),
    ("CONFIG_NF_NAT_IPV4", "y"),
    ("CONFIG_NF_NAT_MASQUERADE_IPV4", "y"),
    ("CONFIG_NFT_PAYLOAD", "y"),
    ("CONFIG_NFT_EXTHDR", "y"),
    ("CONFIG_NFT_META", "y"),
    ("CONFIG_NFT_CT", "y"),
    ("CONFIG_NFT_RBTREE", "y"),
    ("CONFIG_NFT_HASH", "y"),
    ("CONFIG_NFT_COUNTER", "y"),
    ("CONFIG_NFT_LOG", "y"),
    ("CONFIG_NFT_LIMIT", "y"),
    ("CONFIG_NFT_NAT", "y"),
    ("CONFIG_NFT_COMPAT", "y"),
    ("CONFIG_NFT_MASQ", "y"),
    ("CONFIG_NFT_MASQ_IPV4", "y"),
    ("CONFIG_NFT_REDIR", "y"),
    ("CONFIG_NFT_REJECT", "y"),
    ("CONFIG_NF_TABLES_IPV4", "y"),
    ("CONFIG_NFT_REJECT_IPV4", "y"),
    ("CONFIG_NFT_CHAIN_ROUTE_IPV4", "y"),
    ("CONFIG_NFT_CHAIN_NAT_IPV4", "y"),
    ("CONFIG_NF_TABLES_IPV6", "y"),
    ("CONFIG_NFT_CHAIN_ROUTE_IPV6", "y"),
    ("CONFIG_NFT_OBJREF", "y"),
    ("CONFIG_NFT_DUP_IPV4", "y"),
    ("CONFIG_NFT_FIB_IPV4", "y"),
    ("CONFIG_NFT_DUP_IPV6", "y"),
    ("CONFIG_NFT_FIB_IPV6", "y"),
    // conntrack helpers stay off (NAT slipstreaming)
    ("CONFIG_NF_CONNTRACK_AMANDA", "n"),
    ("CONFIG_NF_CONNTRACK_FTP", "n"),
    ("CONFIG_NF_CONNTRACK_H323", "n"),
    ("CONFIG_NF_CONNTRACK_IRC", "n"),
    ("CONFIG_NF_CONNTRACK_NETBIOS_NS", "n"),
    ("CONFIG_NF_CONNTRACK_SNMP", "n"),
    ("CONFIG_NF_CONNTRACK_PPTP", "n"),
    ("CONFIG_NF_CONNTRACK_SANE", "n"),
    ("CONFIG_NF_CONNTRACK_SIP", "n"),
    ("CONFIG_NF_CONNTRACK_TFTP", "n"),
    // usb storage
    ("CONFIG_USB_EHCI_HCD", "y"),
    ("CONFIG_USB_XHCI_HCD", "y"),
    ("CONFIG_USB_DEVICEFS", "y"),
    ("CONFIG_USB_STORAGE", "y"),
    // nvme
    ("CONFIG_NVME_CORE", "y"),
    ("CONFIG_BLK_DEV_NVME", "y"),
    ("CONFIG_NVME_MULTIPATH", "y"),
    ("CONFIG_NVME_TARGET_PASSTHRU", "y"),
    // nics
    ("CONFIG_I40E", "y"),
    ("CONFIG_IGB", "y"),
    ("CONFIG_USB_RTL8152", "y"),
    ("CONFIG_ATL1C", "y"),
    ("CONFIG_ATL2", "y"),
    ("CONFIG_IGC", "y"),
    // /proc/config.gz
    ("CONFIG_IKCONFIG", "y"),
    ("CONFIG_IKCONFIG_PROC", "y"),
    ("CONFIG_KEXEC_FILE", "y"),
    ("CONFIG_SP5100_TCO", "y"),
    // wireguard
    ("CONFIG_NET_UDP_TUNNEL", "y"),
    ("CONFIG_WIREGUARD", "y"),
    ("CONFIG_NET_SCH_TBF", "y"),
    // sensors
    ("CONFIG_SENSORS_K10TEMP", "y"),
    ("CONFIG_SENSORS_NCT6683", "y"),
    ("CONFIG_SENSORS_CORSAIR_CPRO", "y"),
    ("CONFIG_INET_DIAG", "y"),
    ("CONFIG_MACVLAN", "y"),
    // virtio (qemu)
    ("CONFIG_VIRTIO_PCI", "y"),
    ("CONFIG_VIRTIO_BALLOON", "y"),
    ("CONFIG_VIRTIO_BLK", "y"),
    ("CONFIG_VIRTIO_NET", "y"),
    ("CONFIG_VIRTIO", "y"),
    ("CONFIG_VIRTIO_RING", "y"),
    ("CONFIG_I6300ESB_WDT", "y"),
    ("CONFIG_EFIVAR_FS", "y"),
    // ryzen
    ("CONFIG_X86_AMD_PLATFORM_DEVICE", "y"),
    ("CONFIG_CPU_FREQ_DEFAULT_GOV_POWERSAVE", "y"),
    ("CONFIG_CPU_FREQ_GOV_POWERSAVE", "y"),
    ("CONFIG_X86_POWERNOW_K8", "y"),
    ("CONFIG_X86_AMD_FREQ_SENSITIVITY", "y"),
    // RAPL power capping
    ("CONFIG_POWERCAP", "y"),
    ("CONFIG_PERF_EVENTS_INTEL_RAPL", "y"),
    ("CONFIG_PROC_THERMAL_MMIO_RAPL", "y"),
    ("CONFIG_INTEL_RAPL_CORE", "y"),
    ("CONFIG_INTEL_RAPL", "y"),
    ("CONFIG_IRQ_TIME_ACCOUNTING", "y"),
    ("CONFIG_TUN", "y"),
    // runc
    ("CONFIG_BPF_SYSCALL", "y"),
    ("CONFIG_CGROUP_FREEZER", "y"),
    ("CONFIG_CGROUP_BPF", "y"),
    ("CONFIG_SOCK_CGROUP_DATA", "y"),
    ("CONFIG_NET_SOCK_MSG", "y"),
    // podman
    ("CONFIG_OVERLAY_FS", "y"),
    ("CONFIG_BRIDGE", "y"),
    ("CONFIG_VETH", "y"),
    ("CONFIG_NETFILTER_ADVANCED", "y"),
    ("CONFIG_NETFILTER_XT_MATCH_COMMENT", "y"),
    ("CONFIG_IP_NF_NAT", "y"),
    ("CONFIG_IP_NF_TARGET_MASQUERADE", "y"),
    ("CONFIG_NETFILTER_XT_NAT", "y"),
    ("CONFIG_NETFILTER_XT_TARGET_MASQUERADE", "y"),
    ("CONFIG_NETFILTER_XT_MATCH_MULTIPORT", "y"),
    ("CONFIG_NETFILTER_XT_MARK", "y"),
    ("CONFIG_CGROUP_PIDS", "y"),
    ("CONFIG_MEMCG", "y"),
    // bbr
    ("CONFIG_TCP_CONG_BBR", "y"),
    ("CONFIG_DEFAULT_BBR", "y"),
    ("CONFIG_DEFAULT_TCP_CONG", "bbr"),
    // filesystems
    ("CONFIG_EXFAT_FS", "y"),
    ("CONFIG_NTFS3_FS", "y"),
    ("CONFIG_NTFS3_64BIT_CLUSTER", "y"),
    ("CONFIG_NTFS3_LZX_XPRESS", "y"),
    ("CONFIG_NTFS3_FS_POSIX_ACL", "y"),
    ("CONFIG_BTRFS_FS", "y"),
    ("CONFIG_XFS_FS", "y"),
    ("CONFIG_XFS_SUPPORT_V4", "y"),
    // hwmon
    ("CONFIG_NVME_HWMON", "y"),
    ("CONFIG_SCSI_UFS_HWMON", "y"),
    ("CONFIG_TIGON3_HWMON", "y"),
    ("CONFIG_BNXT_HWMON", "y"),
    ("CONFIG_BE2NET_HWMON", "y"),
    ("CONFIG_IGB_HWMON", "y"),
    ("CONFIG_IXGBE_HWMON", "y"),
    ("CONFIG_MLXSW_CORE_HWMON", "y"),
    ("CONFIG_QLCNIC_HWMON", "y"),
    ("CONFIG_POWER_SUPPLY_HWMON", "y"),
    ("CONFIG_HWMON", "y"),
    ("CONFIG_HWMON_VID", "y"),
    ("CONFIG_SENSORS_IIO_HWMON", "y"),
    ("CONFIG_SENSORS_MENF21BMC_HWMON", "y"),
    ("CONFIG_SENSORS_INTEL_M10_BMC_HWMON", "y"),
    ("CONFIG_THERMAL_HWMON", "y"),
    ("CONFIG_RTC_DRV_DS3232_HWMON", "y"),
    ("CONFIG_RTC_DRV_RV3029_HWMON", "y"),
    // wifi
    ("CONFIG_ATH9K", "y"),
    ("CONFIG_ATH9K_AHB", "y"),
    ("CONFIG_RTW88", "m"),
    ("CONFIG_RTW88_CORE", "m"),
    ("CONFIG_RTW88_PCI", "m"),
    ("CONFIG_RTW88_8822B", "m"),
    ("CONFIG_RTW88_8822C", "m"),
    ("CONFIG_RTW88_8723D", "m"),
    ("CONFIG_RTW88_8821C", "m"),
    ("CONFIG_RTW88_8822BE", "m"),
    ("CONFIG_RTW88_8822CE", "m"),
    ("CONFIG_RTW88_8723DE", "m"),
    ("CONFIG_RTW88_8821CE", "m"),
    ("CONFIG_RTW88_DEBUG", "m"),
    ("CONFIG_RTW88_DEBUGFS", "m"),
    ("CONFIG_RTW89", "m"),
    ("CONFIG_RTW89_CORE", "m"),
    ("CONFIG_RTW89_PCI", "m"),
    ("CONFIG_RTW89_8852A", "m"),
    ("CONFIG_RTW89_8852AE", "m"),
    ("CONFIG_RTW89_DEBUG", "m"),
    ("CONFIG_IDEAPAD_LAPTOP", "y"),
    // i915 trips -Werror=address with newer compilers (6.1+)
    ("CONFIG_WERROR", "n"),
];

pub fn builtin() -> Result<Overlay> {
    let mut o = Overlay::new();
    for (name, value) in BUILTIN {
        o.set(name, value)?;
    }
    Ok(o)
}
