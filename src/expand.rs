//! Expansion of program descriptors into concrete fetchers.
//!
//! Descriptors that do not need an image pass through unchanged. Descriptors
//! that do are multiplied out over every visualization method naming them as
//! `caller` and every image, in that order; the resulting order is the probe
//! order.

use std::path::{Path, PathBuf};

use fetch_model::{Fetcher, IMAGE_PLACEHOLDER, ProgramDescriptor, VisualizationMethod};
use tracing::debug;

use crate::command::shell_escape;

pub fn expand(
    descriptors: &[ProgramDescriptor],
    methods: &[VisualizationMethod],
    images: &[PathBuf],
) -> Vec<Fetcher> {
    let mut fetchers = Vec::new();
    for descriptor in descriptors {
        if !descriptor.needs_image {
            fetchers.push(Fetcher::from_descriptor(descriptor));
            continue;
        }

        let matching: Vec<_> = methods
            .iter()
            .filter(|method| method.applies_to(descriptor))
            .collect();
        if matching.is_empty() || images.is_empty() {
            debug!(
                fetcher = %descriptor.name,
                methods = matching.len(),
                images = images.len(),
                "image fetcher has nothing to bind; skipping"
            );
            continue;
        }
        for method in matching {
            for image in images {
                let image_args = bind_image(method, image);
                fetchers.push(Fetcher::bound(descriptor, image_args));
            }
        }
    }
    fetchers
}

/// Method tokens joined with single spaces, every placeholder replaced by the
/// escaped absolute image path.
pub fn bind_image(method: &VisualizationMethod, image: &Path) -> String {
    let escaped = shell_escape(&absolute(image).to_string_lossy());
    method.args.flatten().replace(IMAGE_PLACEHOLDER, &escaped)
}

fn absolute(image: &Path) -> PathBuf {
    if image.is_absolute() {
        return image.to_path_buf();
    }
    std::path::absolute(image).unwrap_or_else(|_| image.to_path_buf())
}
