//! Libvirt XML descriptions.
//!
//! Parsing of domain, volume, pool and host capability documents into the
//! crate's types, and generation of the domain and volume documents the
//! backends define.

use std::collections::BTreeSet;

use quick_xml::escape::escape;
use serde::de::IgnoredAny;
use serde::Deserialize;

use crate::error::{HypervisorError, Result};
use crate::types::*;

// =============================================================================
// DOCUMENT SHAPES
// =============================================================================

#[derive(Debug, Deserialize)]
struct DomainXml {
    name: String,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    memory: Option<SizedValue>,
    #[serde(default)]
    vcpu: Option<CountValue>,
    #[serde(default)]
    cpu: Option<CpuXml>,
    #[serde(default)]
    devices: Option<DevicesXml>,
}

#[derive(Debug, Deserialize)]
struct SizedValue {
    #[serde(rename = "@unit", default)]
    unit: Option<String>,
    #[serde(rename = "$text")]
    value: u64,
}

#[derive(Debug, Deserialize)]
struct CountValue {
    #[serde(rename = "$text")]
    value: u32,
}

#[derive(Debug, Deserialize, Default)]
struct TextValue {
    #[serde(rename = "$text", default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct CpuXml {
    #[serde(rename = "@mode", default)]
    mode: Option<String>,
    #[serde(default)]
    arch: Option<TextValue>,
    #[serde(default)]
    model: Option<TextValue>,
    #[serde(default)]
    vendor: Option<TextValue>,
    #[serde(default)]
    topology: Option<TopologyXml>,
    #[serde(rename = "feature", default)]
    features: Vec<FeatureXml>,
}

#[derive(Debug, Deserialize)]
struct TopologyXml {
    #[serde(rename = "@sockets", default)]
    sockets: Option<u32>,
    #[serde(rename = "@cores", default)]
    cores: Option<u32>,
    #[serde(rename = "@threads", default)]
    threads: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct FeatureXml {
    #[serde(rename = "@policy", default)]
    policy: Option<String>,
    #[serde(rename = "@name")]
    name: String,
}

#[derive(Debug, Deserialize, Default)]
struct DevicesXml {
    #[serde(rename = "disk", default)]
    disks: Vec<DiskXml>,
    #[serde(rename = "interface", default)]
    interfaces: Vec<InterfaceXml>,
}

#[derive(Debug, Deserialize)]
struct DiskXml {
    #[serde(rename = "@device", default)]
    device: Option<String>,
    #[serde(default)]
    driver: Option<TypedXml>,
    #[serde(default)]
    source: Option<DiskSourceXml>,
    #[serde(default)]
    target: Option<DiskTargetXml>,
    #[serde(default)]
    readonly: Option<IgnoredAny>,
}

#[derive(Debug, Deserialize)]
struct TypedXml {
    #[serde(rename = "@type", default)]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DiskSourceXml {
    #[serde(rename = "@file", default)]
    file: Option<String>,
    #[serde(rename = "@dev", default)]
    dev: Option<String>,
    #[serde(rename = "@name", default)]
    name: Option<String>,
    #[serde(rename = "@pool", default)]
    pool: Option<String>,
    #[serde(rename = "@volume", default)]
    volume: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DiskTargetXml {
    #[serde(rename = "@dev")]
    dev: String,
}

#[derive(Debug, Deserialize)]
struct InterfaceXml {
    #[serde(rename = "@type")]
    kind: String,
    #[serde(default)]
    mac: Option<MacXml>,
    #[serde(default)]
    source: Option<InterfaceSourceXml>,
    #[serde(default)]
    model: Option<TypedXml>,
}

#[derive(Debug, Deserialize)]
struct MacXml {
    #[serde(rename = "@address")]
    address: String,
}

#[derive(Debug, Deserialize)]
struct InterfaceSourceXml {
    #[serde(rename = "@network", default)]
    network: Option<String>,
    #[serde(rename = "@bridge", default)]
    bridge: Option<String>,
    #[serde(rename = "@dev", default)]
    dev: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VolumeXml {
    name: String,
    #[serde(default)]
    capacity: Option<SizedValue>,
    #[serde(default)]
    allocation: Option<SizedValue>,
    #[serde(default)]
    target: Option<VolumeTargetXml>,
    #[serde(rename = "backingStore", default)]
    backing_store: Option<VolumeTargetXml>,
}

#[derive(Debug, Deserialize)]
struct VolumeTargetXml {
    #[serde(default)]
    path: Option<TextValue>,
    #[serde(default)]
    format: Option<TypedXml>,
}

#[derive(Debug, Deserialize)]
struct PoolXml {
    #[serde(rename = "@type")]
    kind: String,
    name: String,
    #[serde(default)]
    capacity: Option<SizedValue>,
    #[serde(default)]
    available: Option<SizedValue>,
    #[serde(default)]
    target: Option<VolumeTargetXml>,
}

#[derive(Debug, Deserialize)]
struct CapabilitiesXml {
    host: HostXml,
}

#[derive(Debug, Deserialize)]
struct HostXml {
    #[serde(default)]
    cpu: Option<CpuXml>,
}

// =============================================================================
// PARSING
// =============================================================================

fn parse<'de, T: Deserialize<'de>>(xml: &'de str, what: &str) -> Result<T> {
    quick_xml::de::from_str(xml)
        .map_err(|e| HypervisorError::XmlError(format!("invalid {} XML: {}", what, e)))
}

/// Convert a libvirt sized value to bytes. `default_unit` applies when the
/// element carries no `unit` attribute.
fn to_bytes(value: &SizedValue, default_unit: &str) -> u64 {
    let unit = value.unit.as_deref().unwrap_or(default_unit);
    let factor: u64 = match unit {
        "b" | "B" | "bytes" => 1,
        "KB" => 1_000,
        "k" | "K" | "KiB" => 1 << 10,
        "MB" => 1_000_000,
        "M" | "MiB" => 1 << 20,
        "GB" => 1_000_000_000,
        "G" | "GiB" => 1 << 30,
        "T" | "TiB" => 1 << 40,
        _ => 1,
    };
    value.value.saturating_mul(factor)
}

/// Parse a domain description.
///
/// The power state is not part of the document; the returned record carries
/// [`DomainState::Unknown`] and `persistent = true` for the caller to fill in.
pub fn parse_domain(xml: &str) -> Result<DomainRecord> {
    let doc: DomainXml = parse(xml, "domain")?;

    let memory_mib = doc
        .memory
        .as_ref()
        .map(|m| to_bytes(m, "KiB") / (1 << 20))
        .unwrap_or(0);

    let (cpu_mode, required_cpu_features) = match &doc.cpu {
        Some(cpu) => (
            CpuMode::from_libvirt(cpu.mode.as_deref()),
            cpu.features
                .iter()
                .filter(|f| matches!(f.policy.as_deref(), None | Some("require") | Some("force")))
                .map(|f| f.name.clone())
                .collect(),
        ),
        None => (CpuMode::Unspecified, Vec::new()),
    };

    let devices = doc.devices.unwrap_or_default();

    let disks = devices
        .disks
        .into_iter()
        .filter(|d| d.device.as_deref().unwrap_or("disk") == "disk")
        .filter_map(|d| {
            let target = d.target?.dev;
            let source = d.source;
            let path = source
                .as_ref()
                .and_then(|s| s.file.clone().or_else(|| s.dev.clone()).or_else(|| s.name.clone()))
                .unwrap_or_default();
            Some(DomainDisk {
                target,
                path,
                format: d
                    .driver
                    .and_then(|drv| drv.kind)
                    .map(|f| DiskFormat::parse(&f))
                    .unwrap_or(DiskFormat::Raw),
                pool: source.as_ref().and_then(|s| s.pool.clone()),
                volume: source.as_ref().and_then(|s| s.volume.clone()),
                readonly: d.readonly.is_some(),
            })
        })
        .collect();

    let nics = devices
        .interfaces
        .into_iter()
        .map(|i| DomainNic {
            mac: i.mac.map(|m| m.address),
            source: i
                .source
                .and_then(|s| s.network.or(s.bridge).or(s.dev)),
            model: i.model.and_then(|m| m.kind),
            kind: i.kind,
        })
        .collect();

    Ok(DomainRecord {
        uuid: doc.uuid.unwrap_or_default(),
        name: doc.name,
        state: DomainState::Unknown,
        vcpus: doc.vcpu.map(|v| v.value).unwrap_or(1),
        memory_mib,
        cpu_mode,
        required_cpu_features,
        persistent: true,
        disks,
        nics,
    })
}

/// Parse a storage volume description.
pub fn parse_volume(xml: &str, pool: &str) -> Result<VolumeInfo> {
    let doc: VolumeXml = parse(xml, "volume")?;

    let (path, format) = match doc.target {
        Some(t) => (
            t.path.map(|p| p.value).unwrap_or_default(),
            t.format.and_then(|f| f.kind).map(|f| DiskFormat::parse(&f)).unwrap_or(DiskFormat::Raw),
        ),
        None => (String::new(), DiskFormat::Raw),
    };

    let backing_path = doc
        .backing_store
        .and_then(|b| b.path)
        .map(|p| p.value)
        .filter(|p| !p.is_empty());

    Ok(VolumeInfo {
        name: doc.name,
        pool: pool.to_string(),
        path,
        format,
        capacity_bytes: doc.capacity.as_ref().map(|c| to_bytes(c, "bytes")).unwrap_or(0),
        allocation_bytes: doc.allocation.as_ref().map(|a| to_bytes(a, "bytes")).unwrap_or(0),
        backing_path,
    })
}

/// Parse a storage pool description.
pub fn parse_pool(xml: &str, active: bool) -> Result<PoolInfo> {
    let doc: PoolXml = parse(xml, "pool")?;
    Ok(PoolInfo {
        name: doc.name,
        kind: PoolKind::from_libvirt(&doc.kind),
        active,
        target_path: doc.target.and_then(|t| t.path).map(|p| p.value),
        capacity_bytes: doc.capacity.as_ref().map(|c| to_bytes(c, "bytes")).unwrap_or(0),
        available_bytes: doc.available.as_ref().map(|a| to_bytes(a, "bytes")).unwrap_or(0),
    })
}

/// Parse the host part of a capabilities document.
///
/// Hostname, memory and hypervisor version come from other calls and are
/// left empty.
pub fn parse_capabilities(xml: &str) -> Result<HostCapabilities> {
    let doc: CapabilitiesXml = parse(xml, "capabilities")?;
    let cpu = doc
        .host
        .cpu
        .ok_or_else(|| HypervisorError::XmlError("capabilities without host cpu".to_string()))?;

    let cores = cpu
        .topology
        .as_ref()
        .map(|t| t.sockets.unwrap_or(1) * t.cores.unwrap_or(1) * t.threads.unwrap_or(1))
        .unwrap_or(0);

    Ok(HostCapabilities {
        hostname: String::new(),
        arch: cpu.arch.map(|a| a.value).unwrap_or_default(),
        cpu_model: cpu.model.map(|m| m.value).unwrap_or_default(),
        cpu_vendor: cpu.vendor.map(|v| v.value).unwrap_or_default(),
        cpu_features: cpu.features.into_iter().map(|f| f.name).collect::<BTreeSet<_>>(),
        cpu_cores: cores,
        memory_bytes: 0,
        hypervisor: String::new(),
    })
}

// =============================================================================
// GENERATION
// =============================================================================

/// Builder for libvirt domain XML.
pub struct DomainXmlBuilder<'a> {
    record: &'a DomainRecord,
}

impl<'a> DomainXmlBuilder<'a> {
    pub fn new(record: &'a DomainRecord) -> Self {
        Self { record }
    }

    /// Build the domain XML string.
    pub fn build(&self) -> String {
        let r = self.record;
        let mut xml = format!(
            r#"<domain type='kvm'>
  <name>{}</name>
  <uuid>{}</uuid>
  <memory unit='MiB'>{}</memory>
  <vcpu placement='static'>{}</vcpu>
"#,
            escape(&r.name),
            escape(&r.uuid),
            r.memory_mib,
            r.vcpus
        );

        xml.push_str(&self.build_cpu());

        xml.push_str("  <devices>\n");
        for disk in &r.disks {
            xml.push_str(&Self::build_disk(disk));
        }
        for nic in &r.nics {
            xml.push_str(&Self::build_nic(nic));
        }
        xml.push_str("  </devices>\n");
        xml.push_str("</domain>\n");
        xml
    }

    fn build_cpu(&self) -> String {
        let mode = match self.record.cpu_mode.as_libvirt() {
            Some(mode) => mode,
            None if self.record.required_cpu_features.is_empty() => return String::new(),
            None => "custom",
        };

        if self.record.required_cpu_features.is_empty() {
            return format!("  <cpu mode='{}'/>\n", mode);
        }

        let mut xml = format!("  <cpu mode='{}'>\n", mode);
        for feature in &self.record.required_cpu_features {
            xml.push_str(&format!(
                "    <feature policy='require' name='{}'/>\n",
                escape(feature)
            ));
        }
        xml.push_str("  </cpu>\n");
        xml
    }

    fn build_disk(disk: &DomainDisk) -> String {
        let source = match (&disk.pool, &disk.volume) {
            (Some(pool), Some(volume)) => format!(
                "<source pool='{}' volume='{}'/>",
                escape(pool),
                escape(volume)
            ),
            _ => format!("<source file='{}'/>", escape(&disk.path)),
        };
        let kind = if disk.volume.is_some() && disk.pool.is_some() { "volume" } else { "file" };

        format!(
            r#"    <disk type='{}' device='disk'>
      <driver name='qemu' type='{}'/>
      {}
      <target dev='{}'/>
{}    </disk>
"#,
            kind,
            disk.format.as_str(),
            source,
            escape(&disk.target),
            if disk.readonly { "      <readonly/>\n" } else { "" }
        )
    }

    fn build_nic(nic: &DomainNic) -> String {
        let mut xml = format!("    <interface type='{}'>\n", escape(&nic.kind));
        if let Some(mac) = &nic.mac {
            xml.push_str(&format!("      <mac address='{}'/>\n", escape(mac)));
        }
        if let Some(source) = &nic.source {
            let attr = match nic.kind.as_str() {
                "bridge" => "bridge",
                "direct" => "dev",
                _ => "network",
            };
            xml.push_str(&format!("      <source {}='{}'/>\n", attr, escape(source)));
        }
        if let Some(model) = &nic.model {
            xml.push_str(&format!("      <model type='{}'/>\n", escape(model)));
        }
        xml.push_str("    </interface>\n");
        xml
    }
}

/// Generate a volume definition.
pub fn volume_xml(spec: &VolumeSpec) -> String {
    let mut xml = format!(
        r#"<volume>
  <name>{}</name>
  <capacity unit='bytes'>{}</capacity>
  <target>
    <format type='{}'/>
  </target>
"#,
        escape(&spec.name),
        spec.capacity_bytes,
        spec.format.as_str()
    );

    if let Some((path, format)) = &spec.backing {
        xml.push_str(&format!(
            "  <backingStore>\n    <path>{}</path>\n    <format type='{}'/>\n  </backingStore>\n",
            escape(path),
            format.as_str()
        ));
    }

    xml.push_str("</volume>\n");
    xml
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOMAIN: &str = r#"
<domain type='kvm' id='3'>
  <name>web-01</name>
  <uuid>6f1c2a3e-8d4b-4c1a-9e2f-0a1b2c3d4e5f</uuid>
  <memory unit='KiB'>4194304</memory>
  <currentMemory unit='KiB'>4194304</currentMemory>
  <vcpu placement='static'>4</vcpu>
  <os><type arch='x86_64' machine='pc-q35-8.2'>hvm</type></os>
  <cpu mode='host-passthrough' check='none' migratable='on'/>
  <devices>
    <emulator>/usr/bin/qemu-system-x86_64</emulator>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='/var/lib/libvirt/images/web-01.qcow2'/>
      <backingStore type='file'>
        <format type='qcow2'/>
        <source file='/var/lib/libvirt/images/base.qcow2'/>
      </backingStore>
      <target dev='vda' bus='virtio'/>
    </disk>
    <disk type='file' device='cdrom'>
      <driver name='qemu' type='raw'/>
      <target dev='sda' bus='sata'/>
      <readonly/>
    </disk>
    <controller type='usb' index='0'/>
    <disk type='volume' device='disk'>
      <driver name='qemu' type='raw'/>
      <source pool='data' volume='web-01-data.img'/>
      <target dev='vdb' bus='virtio'/>
    </disk>
    <interface type='network'>
      <mac address='52:54:00:aa:bb:cc'/>
      <source network='default'/>
      <model type='virtio'/>
    </interface>
    <graphics type='vnc' port='-1'/>
  </devices>
</domain>"#;

    #[test]
    fn test_parse_domain() {
        let record = parse_domain(DOMAIN).unwrap();
        assert_eq!(record.name, "web-01");
        assert_eq!(record.uuid, "6f1c2a3e-8d4b-4c1a-9e2f-0a1b2c3d4e5f");
        assert_eq!(record.memory_mib, 4096);
        assert_eq!(record.vcpus, 4);
        assert_eq!(record.cpu_mode, CpuMode::HostPassthrough);

        // cdrom is not a migratable disk
        assert_eq!(record.disks.len(), 2);
        assert_eq!(record.disks[0].path, "/var/lib/libvirt/images/web-01.qcow2");
        assert_eq!(record.disks[0].format, DiskFormat::Qcow2);
        assert_eq!(record.disks[1].pool.as_deref(), Some("data"));
        assert_eq!(record.disks[1].volume.as_deref(), Some("web-01-data.img"));

        assert_eq!(record.nics.len(), 1);
        assert_eq!(record.nics[0].source.as_deref(), Some("default"));
        assert_eq!(record.nics[0].mac.as_deref(), Some("52:54:00:aa:bb:cc"));
    }

    #[test]
    fn test_generated_domain_parses_back() {
        let mut record = parse_domain(DOMAIN).unwrap();
        record.cpu_mode = CpuMode::Custom;
        record.required_cpu_features = vec!["avx2".to_string()];

        let xml = DomainXmlBuilder::new(&record).build();
        let parsed = parse_domain(&xml).unwrap();

        assert_eq!(parsed.name, record.name);
        assert_eq!(parsed.memory_mib, 4096);
        assert_eq!(parsed.disks, record.disks);
        assert_eq!(parsed.required_cpu_features, vec!["avx2".to_string()]);
    }

    #[test]
    fn test_parse_volume_with_backing_store() {
        let xml = r#"
<volume type='file'>
  <name>web-01.qcow2</name>
  <key>/var/lib/libvirt/images/web-01.qcow2</key>
  <capacity unit='bytes'>21474836480</capacity>
  <allocation unit='bytes'>1310720</allocation>
  <target>
    <path>/var/lib/libvirt/images/web-01.qcow2</path>
    <format type='qcow2'/>
  </target>
  <backingStore>
    <path>/var/lib/libvirt/images/base.qcow2</path>
    <format type='qcow2'/>
  </backingStore>
</volume>"#;
        let vol = parse_volume(xml, "default").unwrap();
        assert_eq!(vol.capacity_bytes, 20 * 1024 * 1024 * 1024);
        assert_eq!(vol.format, DiskFormat::Qcow2);
        assert_eq!(vol.backing_path.as_deref(), Some("/var/lib/libvirt/images/base.qcow2"));
        assert_eq!(vol.pool, "default");
    }

    #[test]
    fn test_parse_pool_and_capabilities() {
        let pool = parse_pool(
            r#"<pool type='netfs'><name>shared</name>
               <capacity unit='bytes'>1000</capacity><available unit='bytes'>400</available>
               <target><path>/mnt/shared</path></target></pool>"#,
            true,
        )
        .unwrap();
        assert_eq!(pool.kind, PoolKind::Netfs);
        assert_eq!(pool.available_bytes, 400);
        assert_eq!(pool.target_path.as_deref(), Some("/mnt/shared"));

        let caps = parse_capabilities(
            r#"<capabilities><host><uuid>x</uuid><cpu><arch>x86_64</arch>
               <model>Skylake-Client-IBRS</model><vendor>Intel</vendor>
               <topology sockets='1' dies='1' cores='4' threads='2'/>
               <feature name='vmx'/><feature name='avx2'/></cpu></host></capabilities>"#,
        )
        .unwrap();
        assert_eq!(caps.arch, "x86_64");
        assert_eq!(caps.cpu_cores, 8);
        assert!(caps.cpu_features.contains("avx2"));
    }

    #[test]
    fn test_volume_xml_contains_backing() {
        let xml = volume_xml(&VolumeSpec {
            name: "overlay.qcow2".to_string(),
            format: DiskFormat::Qcow2,
            capacity_bytes: 1024,
            backing: Some(("/pool/base.qcow2".to_string(), DiskFormat::Qcow2)),
        });
        assert!(xml.contains("<backingStore>"));
        assert!(xml.contains("/pool/base.qcow2"));
    }

    #[test]
    fn test_invalid_xml_is_an_error() {
        assert!(matches!(parse_domain("<domain>"), Err(HypervisorError::XmlError(_))));
    }
}
