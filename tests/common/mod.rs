//! On-disk image fixtures for integration tests

#![allow(dead_code)]

use flate2::Compression;
use flate2::write::GzEncoder;
use registry_pusher::image::manifest::{OCI_CONFIG_V1, OCI_LAYER_TAR, OCI_MANIFEST_V1};
use registry_pusher::image::{Descriptor, DigestUtils, ImageManifest};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

fn append(builder: &mut tar::Builder<impl Write>, name: &str, data: &[u8]) {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, data).unwrap();
}

fn write_archive<W: Write>(writer: W, tag: &str, layers: &[&[u8]]) -> W {
    let mut builder = tar::Builder::new(writer);
    let config = format!(r#"{{"architecture":"amd64","os":"linux","tag":"{}"}}"#, tag);
    append(&mut builder, "config.json", config.as_bytes());

    let mut names = Vec::new();
    for (i, layer) in layers.iter().enumerate() {
        let name = format!("layer{}/layer.tar", i);
        append(&mut builder, &name, layer);
        names.push(name);
    }
    let manifest = serde_json::json!([{
        "Config": "config.json",
        "RepoTags": [tag],
        "Layers": names,
    }]);
    append(&mut builder, "manifest.json", manifest.to_string().as_bytes());
    builder.into_inner().unwrap()
}

/// `docker save` style archive at `dir/file_name`.
pub fn write_tarball(dir: &Path, file_name: &str, layers: &[&[u8]]) -> PathBuf {
    let path = dir.join(file_name);
    let tag = format!("{}:latest", file_name.split('.').next().unwrap_or("image"));
    let file = File::create(&path).unwrap();

    if file_name.ends_with(".gz") || file_name.ends_with(".tgz") {
        let encoder = write_archive(GzEncoder::new(file, Compression::fast()), &tag, layers);
        encoder.finish().unwrap();
    } else {
        write_archive(file, &tag, layers);
    }
    path
}

fn write_blob(root: &Path, data: &[u8]) -> String {
    let digest = DigestUtils::compute_docker_digest(data);
    let dir = root.join("blobs").join("sha256");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(&digest["sha256:".len()..]), data).unwrap();
    digest
}

/// OCI image layout directory at `dir`, optionally annotated with a ref name.
pub fn write_layout(dir: &Path, ref_name: Option<&str>, layer: &[u8]) -> PathBuf {
    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join("oci-layout"), r#"{"imageLayoutVersion":"1.0.0"}"#).unwrap();

    let config_bytes = br#"{"architecture":"amd64","os":"linux"}"#;
    let config = write_blob(dir, config_bytes);
    let layer_digest = write_blob(dir, layer);
    let manifest = ImageManifest::new(
        Descriptor::new(OCI_CONFIG_V1, config, config_bytes.len() as u64),
        vec![Descriptor::new(OCI_LAYER_TAR, layer_digest, layer.len() as u64)],
    );
    let raw = serde_json::to_vec(&manifest).unwrap();
    let digest = write_blob(dir, &raw);

    let mut descriptor = serde_json::json!({
        "mediaType": OCI_MANIFEST_V1,
        "digest": digest,
        "size": raw.len(),
    });
    if let Some(name) = ref_name {
        descriptor["annotations"]["org.opencontainers.image.ref.name"] = serde_json::json!(name);
    }
    let index = serde_json::json!({ "schemaVersion": 2, "manifests": [descriptor] });
    fs::write(dir.join("index.json"), index.to_string()).unwrap();
    dir.to_path_buf()
}
