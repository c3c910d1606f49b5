//! `scratch` source: an empty root filesystem.

use super::{ConveyorPacker, SourceKind};
use crate::bundle::Bundle;
use crate::error::Result;
use async_trait::async_trait;
use tracing::debug;

/// ConveyorPacker that leaves the bundle's rootfs empty.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScratchConveyorPacker;

#[async_trait]
impl ConveyorPacker for ScratchConveyorPacker {
    fn kind(&self) -> SourceKind {
        SourceKind::Scratch
    }

    async fn fetch(&mut self, _bundle: &Bundle) -> Result<()> {
        Ok(())
    }

    async fn pack(&mut self, bundle: &mut Bundle) -> Result<()> {
        tokio::fs::create_dir_all(&bundle.rootfs).await?;
        debug!(rootfs = %bundle.rootfs.display(), "scratch root ready");
        Ok(())
    }
}
