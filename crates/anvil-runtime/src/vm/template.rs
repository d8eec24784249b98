use anvil_core::error::{AnvilError, Result};
use anvil_core::model::{NodeConnection, OsFamily, VmTemplate};

use crate::runner::CommandRunner;
use crate::vm::disk;

/// Declared source format of an uploaded VM image, handed in by the
/// caller after upload validation. Kept local to this crate rather than
/// depending on the upload format detector directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Qcow2,
    Ova,
    Vmdk,
    Vdi,
    Raw,
}

pub struct RegisterTemplateRequest {
    pub id: String,
    pub name: String,
    pub source_format: SourceFormat,
    pub source_path: String,
    /// Directory the final QCOW2 (and any extracted intermediates) are
    /// written under, e.g. `/var/lib/anvil/storage/vms/templates`.
    pub templates_dir: String,
    pub vcpu: u32,
    pub memory_mb: u32,
    pub disk_gb: u32,
    pub os_family: OsFamily,
    pub exposed_services: Vec<String>,
    pub requires_nested_virt: bool,
    pub public: bool,
}

/// Registers an uploaded image as a usable VM template, converting to
/// QCOW2 first if necessary. OVA images are tar archives containing a
/// `.vmdk` disk; that disk is extracted and then converted like a plain
/// VMDK.
pub async fn register_template(
    runner: &dyn CommandRunner,
    req: RegisterTemplateRequest,
) -> Result<VmTemplate> {
    let final_path = format!("{}/{}.qcow2", req.templates_dir, req.id);

    match req.source_format {
        SourceFormat::Qcow2 => {
            runner.run("cp", &[&req.source_path, &final_path]).await?;
        }
        SourceFormat::Ova => {
            let extract_dir = format!("{}/.extract-{}", req.templates_dir, req.id);
            runner.run("mkdir", &["-p", &extract_dir]).await?;
            runner
                .run("tar", &["-xf", &req.source_path, "-C", &extract_dir])
                .await?;
            let listing = runner.run("find", &[&extract_dir, "-name", "*.vmdk"]).await?;
            let vmdk_path = listing
                .lines()
                .next()
                .ok_or_else(|| AnvilError::Validation {
                    message: "OVA archive contains no .vmdk disk".to_string(),
                })?
                .to_string();
            disk::convert_to_qcow2(runner, "vmdk", &vmdk_path, &final_path).await?;
            let _ = runner.run("rm", &["-rf", &extract_dir]).await;
        }
        SourceFormat::Vmdk => {
            disk::convert_to_qcow2(runner, "vmdk", &req.source_path, &final_path).await?;
        }
        SourceFormat::Vdi => {
            disk::convert_to_qcow2(runner, "vdi", &req.source_path, &final_path).await?;
        }
        SourceFormat::Raw => {
            disk::convert_to_qcow2(runner, "raw", &req.source_path, &final_path).await?;
        }
    }

    Ok(VmTemplate {
        id: req.id,
        name: req.name,
        image_path: final_path,
        vcpu: req.vcpu,
        memory_mb: req.memory_mb,
        disk_gb: req.disk_gb,
        os_family: req.os_family,
        exposed_services: req.exposed_services,
        requires_nested_virt: req.requires_nested_virt,
        public: req.public,
        active: true,
    })
}

/// Lists `anvil-*` domains defined on a node, for orphan reconciliation.
pub async fn list_anvil_domains(runner: &dyn CommandRunner, conn: &NodeConnection) -> Result<Vec<String>> {
    let output = crate::runner::virsh(runner, conn, &["list", "--all", "--name"]).await?;
    Ok(output
        .lines()
        .map(str::trim)
        .filter(|name| name.starts_with("anvil-"))
        .map(str::to_string)
        .collect())
}
