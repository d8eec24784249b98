use anvil_core::error::{AnvilError, Result};
use tera::{Context, Tera};

const DOMAIN_TEMPLATE: &str = r#"<domain type='kvm'>
  <name>{{ name }}</name>
  <uuid>{{ uuid }}</uuid>
  <memory unit='MiB'>{{ memory_mb }}</memory>
  <currentMemory unit='MiB'>{{ memory_mb }}</currentMemory>
  <vcpu placement='static'>{{ vcpu }}</vcpu>
  <os>
    <type arch='x86_64'>hvm</type>
    <boot dev='hd'/>
  </os>
  <features>
    <acpi/>
    <apic/>
  </features>
  <cpu mode='host-passthrough'/>
  <on_poweroff>destroy</on_poweroff>
  <on_reboot>restart</on_reboot>
  <on_crash>destroy</on_crash>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='{{ disk_path }}'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <interface type='network'>
      <mac address='{{ mac }}'/>
      <source network='{{ source_network }}'/>
      <model type='virtio'/>
    </interface>
    <graphics type='vnc' port='{{ vnc_port }}' autoport='no' listen='0.0.0.0'/>
    <video>
      <model type='virtio'/>
    </video>
    <serial type='pty'>
      <target port='0'/>
    </serial>
    <console type='pty'>
      <target type='serial' port='0'/>
    </console>
  </devices>
</domain>
"#;

pub struct DomainParams<'a> {
    pub name: &'a str,
    pub uuid: &'a str,
    pub memory_mb: u32,
    pub vcpu: u32,
    pub disk_path: &'a str,
    pub mac: &'a str,
    pub source_network: &'a str,
    pub vnc_port: u16,
}

pub fn render_domain_xml(params: &DomainParams) -> Result<String> {
    let mut tera = Tera::default();
    tera.add_raw_template("domain.xml", DOMAIN_TEMPLATE)
        .map_err(|e| AnvilError::internal(format!("register domain template: {e}")))?;

    let mut ctx = Context::new();
    ctx.insert("name", params.name);
    ctx.insert("uuid", params.uuid);
    ctx.insert("memory_mb", &params.memory_mb);
    ctx.insert("vcpu", &params.vcpu);
    ctx.insert("disk_path", params.disk_path);
    ctx.insert("mac", params.mac);
    ctx.insert("source_network", params.source_network);
    ctx.insert("vnc_port", &params.vnc_port);

    tera.render("domain.xml", &ctx)
        .map_err(|e| AnvilError::internal(format!("render domain xml: {e}")))
}
