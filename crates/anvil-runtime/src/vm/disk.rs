use anvil_core::error::Result;

use crate::runner::CommandRunner;

/// Creates a copy-on-write overlay backed by a shared, read-only template.
/// The template is never written to; every instance writes only to its
/// own overlay.
pub async fn create_overlay(runner: &dyn CommandRunner, template_path: &str, overlay_path: &str) -> Result<()> {
    runner
        .run(
            "qemu-img",
            &["create", "-f", "qcow2", "-F", "qcow2", "-b", template_path, overlay_path],
        )
        .await?;
    Ok(())
}

pub async fn remove_overlay(runner: &dyn CommandRunner, overlay_path: &str) -> Result<()> {
    let _ = runner.run("rm", &["-f", overlay_path]).await;
    Ok(())
}

/// Converts a non-QCOW2 source image to QCOW2 with lazy refcounts, the
/// format template registration always stores on disk.
pub async fn convert_to_qcow2(runner: &dyn CommandRunner, src_format: &str, src_path: &str, dst_path: &str) -> Result<()> {
    runner
        .run(
            "qemu-img",
            &[
                "convert",
                "-f",
                src_format,
                "-O",
                "qcow2",
                "-o",
                "lazy_refcounts=on",
                src_path,
                dst_path,
            ],
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct MockRunner(Mutex<Vec<String>>);

    #[async_trait]
    impl CommandRunner for MockRunner {
        async fn run(&self, program: &str, args: &[&str]) -> Result<String> {
            self.0.lock().unwrap().push(format!("{program} {}", args.join(" ")));
            Ok(String::new())
        }
    }

    #[tokio::test]
    async fn create_overlay_uses_backing_file() {
        let runner = MockRunner(Mutex::new(Vec::new()));
        create_overlay(&runner, "/templates/base.qcow2", "/overlays/i-1.qcow2")
            .await
            .unwrap();
        let calls = runner.0.lock().unwrap();
        assert_eq!(
            calls[0],
            "qemu-img create -f qcow2 -F qcow2 -b /templates/base.qcow2 /overlays/i-1.qcow2"
        );
    }

    #[tokio::test]
    async fn convert_sets_lazy_refcounts() {
        let runner = MockRunner(Mutex::new(Vec::new()));
        convert_to_qcow2(&runner, "vmdk", "/src.vmdk", "/dst.qcow2").await.unwrap();
        assert!(runner.0.lock().unwrap()[0].contains("lazy_refcounts=on"));
    }
}
