use std::collections::HashMap;
use std::path::Path;

use anvil_core::error::{AnvilError, Result};
use sha2::Digest as _;

/// First ~33 KiB are inspected for magic bytes — ISO 9660's primary
/// volume descriptor lives at offset 32769, the deepest signature we
/// look for.
const MAGIC_SCAN_WINDOW: usize = 33 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectedFormat {
    Gzip,
    Zip,
    Tar,
    Qcow2,
    VmdkSparse,
    VmdkDescriptor,
    Vdi,
    Iso9660,
    Dockerfile,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct MalwareReport {
    pub scanned: bool,
    pub clean: bool,
    pub threats: Vec<String>,
    pub scanner: Option<String>,
}

impl Default for MalwareReport {
    fn default() -> Self {
        Self {
            scanned: false,
            clean: true,
            threats: Vec::new(),
            scanner: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub valid: bool,
    pub detected_format: DetectedFormat,
    pub checksum: String,
    pub metadata: HashMap<String, String>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub malware: MalwareReport,
}

/// Detects the file format from magic bytes in `data` (the first
/// `MAGIC_SCAN_WINDOW` bytes of the target file).
pub fn detect_format(data: &[u8]) -> DetectedFormat {
    if data.starts_with(&[0x1f, 0x8b]) {
        return DetectedFormat::Gzip;
    }
    if data.starts_with(&[0x50, 0x4b, 0x03, 0x04]) {
        return DetectedFormat::Zip;
    }
    if data.starts_with(&[0x51, 0x46, 0x49, 0xfb]) {
        return DetectedFormat::Qcow2;
    }
    if data.len() >= 4 && &data[0..4] == b"KDMV" {
        return DetectedFormat::VmdkSparse;
    }
    if data.starts_with(b"# Disk DescriptorFile") {
        return DetectedFormat::VmdkDescriptor;
    }
    if data.starts_with(b"<<<< Oracle VM") {
        return DetectedFormat::Vdi;
    }
    if data.len() >= 257 + 5 && &data[257..257 + 5] == b"ustar" {
        return DetectedFormat::Tar;
    }
    if data.len() >= 32769 + 5 && &data[32769..32769 + 5] == b"CD001" {
        return DetectedFormat::Iso9660;
    }
    if is_probably_text(data) && contains_word(data, b"FROM") {
        return DetectedFormat::Dockerfile;
    }
    DetectedFormat::Unknown
}

fn is_probably_text(data: &[u8]) -> bool {
    let sample = &data[..data.len().min(4096)];
    sample
        .iter()
        .all(|b| b.is_ascii_graphic() || b.is_ascii_whitespace())
}

fn contains_word(haystack: &[u8], word: &[u8]) -> bool {
    haystack.windows(word.len()).any(|w| w == word)
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Validates a finalized upload at `path` against its declared `tag`,
/// reading at most `MAGIC_SCAN_WINDOW` bytes for magic-byte detection
/// and the full file for checksum/structural checks.
pub async fn validate(path: &Path, tag: &str) -> Result<ValidationReport> {
    let full = tokio::fs::read(path)
        .await
        .map_err(|e| AnvilError::internal(format!("read {}: {e}", path.display())))?;
    let window = &full[..full.len().min(MAGIC_SCAN_WINDOW)];

    let detected = detect_format(window);
    let checksum = sha256_hex(&full);

    let mut report = ValidationReport {
        valid: true,
        detected_format: detected.clone(),
        checksum,
        metadata: HashMap::new(),
        errors: Vec::new(),
        warnings: Vec::new(),
        malware: MalwareReport::default(),
    };

    match tag {
        "dockerfile" => validate_dockerfile(&full, &mut report),
        "docker_context" => validate_docker_context(&full, &detected, &mut report),
        "docker_image" => validate_docker_image(&full, &detected, &mut report),
        "ova" => validate_ova(&full, &detected, &mut report),
        "vmdk" => validate_vmdk(&detected, &mut report),
        "qcow2" => validate_qcow2(&full, &detected, &mut report),
        "vdi" => validate_vdi(&detected, &mut report),
        "iso" => validate_iso(&full, &detected, &mut report),
        other => {
            report.valid = false;
            report.errors.push(format!("no validator for tag {other}"));
        }
    }

    if !report.errors.is_empty() {
        report.valid = false;
    }

    Ok(report)
}

fn validate_dockerfile(data: &[u8], report: &mut ValidationReport) {
    if !contains_word(data, b"FROM") {
        report.errors.push("missing FROM instruction".into());
        return;
    }
    let text = String::from_utf8_lossy(data);
    if let Some(line) = text.lines().find(|l| l.trim_start().starts_with("FROM")) {
        if let Some(image) = line.split_whitespace().nth(1) {
            report
                .metadata
                .insert("base_image".to_string(), image.to_string());
        }
    }

    let add_url = regex::Regex::new(r"(?i)ADD\s+https?://").unwrap();
    let pipe_sh = regex::Regex::new(r"(?i)(curl|wget)[^\n]*\|\s*sh").unwrap();
    if add_url.is_match(&text) {
        report.warnings.push("ADD from a remote URL".into());
    }
    if pipe_sh.is_match(&text) {
        report.warnings.push("pipes a remote download into a shell".into());
    }
}

/// Lists every entry path in a tar archive, transparently decompressing
/// gzip-wrapped tars first. Read-only: entries are never extracted to
/// disk, matching how `validate` already holds the whole file in memory.
fn tar_entry_paths(full: &[u8], detected: &DetectedFormat) -> std::result::Result<Vec<std::path::PathBuf>, String> {
    let mut archive = if *detected == DetectedFormat::Gzip {
        tar::Archive::new(Box::new(flate2::read::GzDecoder::new(full)) as Box<dyn std::io::Read + '_>)
    } else {
        tar::Archive::new(Box::new(full) as Box<dyn std::io::Read + '_>)
    };

    let mut paths = Vec::new();
    for entry in archive.entries().map_err(|e| e.to_string())? {
        let entry = entry.map_err(|e| e.to_string())?;
        paths.push(entry.path().map_err(|e| e.to_string())?.into_owned());
    }
    Ok(paths)
}

fn has_path_traversal(paths: &[std::path::PathBuf]) -> bool {
    paths
        .iter()
        .any(|p| p.components().any(|c| matches!(c, std::path::Component::ParentDir)))
}

fn file_name_is(path: &std::path::Path, name: &str) -> bool {
    path.file_name().map(|n| n == name).unwrap_or(false)
}

fn extension_is(path: &std::path::Path, ext: &str) -> bool {
    path.extension().map(|e| e.eq_ignore_ascii_case(ext)).unwrap_or(false)
}

fn validate_docker_context(full: &[u8], detected: &DetectedFormat, report: &mut ValidationReport) {
    if !matches!(detected, DetectedFormat::Tar | DetectedFormat::Gzip) {
        report.errors.push("not a valid tar archive".into());
        return;
    }
    let paths = match tar_entry_paths(full, detected) {
        Ok(p) => p,
        Err(e) => {
            report.errors.push(format!("failed to read tar archive: {e}"));
            return;
        }
    };
    if has_path_traversal(&paths) {
        report.errors.push("archive contains a path-traversal (..) entry".into());
    }
    if !paths.iter().any(|p| file_name_is(p, "Dockerfile")) {
        report.errors.push("build context has no Dockerfile".into());
    }
    report.metadata.insert("entry_count".to_string(), paths.len().to_string());
}

fn validate_docker_image(full: &[u8], detected: &DetectedFormat, report: &mut ValidationReport) {
    if !matches!(detected, DetectedFormat::Tar) {
        report.errors.push("not a valid tar archive".into());
        return;
    }
    let paths = match tar_entry_paths(full, detected) {
        Ok(p) => p,
        Err(e) => {
            report.errors.push(format!("failed to read tar archive: {e}"));
            return;
        }
    };
    if has_path_traversal(&paths) {
        report.errors.push("archive contains a path-traversal (..) entry".into());
    }
    if !paths.iter().any(|p| file_name_is(p, "manifest.json")) {
        report.errors.push("image archive has no manifest.json".into());
    }
    let layer_count = paths.iter().filter(|p| file_name_is(p, "layer.tar")).count();
    if layer_count == 0 {
        report.errors.push("image archive has no layer.tar entries".into());
    } else {
        report.metadata.insert("layer_count".to_string(), layer_count.to_string());
    }
}

fn validate_ova(full: &[u8], detected: &DetectedFormat, report: &mut ValidationReport) {
    if !matches!(detected, DetectedFormat::Tar) {
        report.errors.push("not a valid tar archive".into());
        return;
    }
    let paths = match tar_entry_paths(full, detected) {
        Ok(p) => p,
        Err(e) => {
            report.errors.push(format!("failed to read tar archive: {e}"));
            return;
        }
    };
    if has_path_traversal(&paths) {
        report.errors.push("archive contains a path-traversal (..) entry".into());
    }
    if !paths.iter().any(|p| extension_is(p, "ovf")) {
        report.errors.push("OVA has no .ovf descriptor".into());
    }
    if !paths.iter().any(|p| extension_is(p, "vmdk")) {
        report.errors.push("OVA has no .vmdk disk".into());
    }
}

fn validate_vmdk(detected: &DetectedFormat, report: &mut ValidationReport) {
    match detected {
        DetectedFormat::VmdkSparse => {
            report
                .metadata
                .insert("vmdk_type".to_string(), "sparse".to_string());
        }
        DetectedFormat::VmdkDescriptor => {
            report
                .metadata
                .insert("vmdk_type".to_string(), "descriptor".to_string());
        }
        _ => report.errors.push("not a recognized VMDK".into()),
    }
}

fn validate_qcow2(full: &[u8], detected: &DetectedFormat, report: &mut ValidationReport) {
    if *detected != DetectedFormat::Qcow2 {
        report.errors.push("missing QCOW2 magic".into());
        return;
    }
    if full.len() < 32 {
        report.errors.push("file too short for a QCOW2 header".into());
        return;
    }
    let version = u32::from_be_bytes(full[4..8].try_into().unwrap());
    let virtual_size = u64::from_be_bytes(full[24..32].try_into().unwrap());
    report.metadata.insert("version".to_string(), version.to_string());
    report
        .metadata
        .insert("virtual_size".to_string(), virtual_size.to_string());
}

fn validate_vdi(detected: &DetectedFormat, report: &mut ValidationReport) {
    if *detected != DetectedFormat::Vdi {
        report.errors.push("missing VDI magic".into());
    }
}

fn validate_iso(full: &[u8], detected: &DetectedFormat, report: &mut ValidationReport) {
    if *detected != DetectedFormat::Iso9660 {
        report.errors.push("missing ISO9660 PVD at offset 32769".into());
        return;
    }
    if full.len() >= 32808 + 32 {
        let label = String::from_utf8_lossy(&full[32808..32808 + 32])
            .trim()
            .to_string();
        report.metadata.insert("volume_label".to_string(), label);
    }
}

/// Separate entry point: warns on common Dockerfile hardening gaps.
pub fn lint_dockerfile(text: &str) -> Vec<String> {
    let mut warnings = Vec::new();
    if !text.lines().any(|l| l.trim_start().starts_with("USER")) {
        warnings.push("no USER instruction — container runs as root".into());
    }
    if regex::Regex::new(r":latest\b").unwrap().is_match(text) {
        warnings.push("pins a :latest tag".into());
    }
    if text.contains("--privileged") {
        warnings.push("requests --privileged".into());
    }
    if regex::Regex::new(r"--cap-add").unwrap().is_match(text) {
        warnings.push("requests --cap-add".into());
    }
    if text.contains("/var/run/docker.sock") {
        warnings.push("mounts the Docker socket".into());
    }
    if text.contains("/etc/shadow") {
        warnings.push("mounts /etc/shadow".into());
    }
    warnings
}
