//! Vertical concatenation of local strip files.

use std::io;
use std::path::{Path, PathBuf};

use futures::future;
use thiserror::Error;

use crate::assemble::{self, Layout};
use crate::fragment::Fragment;
use crate::png::{self, Image};

#[derive(Debug, Error)]
pub enum Error {
    #[error("{}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{}: {source}", .path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: png::Error,
    },
    #[error(transparent)]
    Assemble(#[from] assemble::Error),
}

/// Read every image of `paths` and stack them, the first one on top.
///
/// Files are read concurrently; any unreadable or invalid file fails the whole concatenation.
pub async fn concat_files<P: AsRef<Path>>(paths: impl IntoIterator<Item = P>) -> Result<Image, Error> {
    let fragments = future::try_join_all(paths.into_iter().enumerate().map(|(index, path)| {
        let path = path.as_ref().to_owned();

        async move {
            let bytes = tokio::fs::read(&path).await.map_err(|source| Error::Read {
                path: path.clone(),
                source,
            })?;

            let image = Image::decode(&bytes[..]).map_err(|source| Error::Decode { path: path.clone(), source })?;

            tracing::debug!(
                "Read {}x{} strip #{index} from `{}`",
                image.header.width,
                image.header.height,
                path.display()
            );

            Ok::<_, Error>(Fragment::new(index, image))
        }
    }))
    .await?;

    Ok(assemble::assemble_fragments(&fragments, Layout::Derived)?)
}
