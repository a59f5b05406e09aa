//! Output materialization.
//!
//! After a node succeeds, each of its declared outputs is pulled out of the
//! location its result context points at (a directory, a `.tar.gz`, or a
//! `.zip`) and placed in the node's staging directory. Dependents glob their
//! inputs from there.

use super::definition::{JobNode, WorkflowDefinition};
use crate::error::MaterializeError;
use crate::substrate::{ResultContext, OUTPUT_ARCHIVE_KEY, OUTPUT_DIR_KEY, OUTPUT_ZIP_KEY};
use flate2::read::GzDecoder;
use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Places produced files into staging directories
#[derive(Debug, Clone, Copy)]
pub struct OutputMaterializer {
    prefer_links: bool,
}

impl OutputMaterializer {
    pub fn new(prefer_links: bool) -> Self {
        Self { prefer_links }
    }

    /// Materialize a node's declared outputs into its staging directory
    pub async fn materialize(
        &self,
        node: &JobNode,
        result: &ResultContext,
    ) -> Result<Vec<PathBuf>, MaterializeError> {
        let this = *self;
        let declared = node.declared_outputs.clone();
        let staging_dir = node.staging_dir.clone();
        let result = result.clone();

        tokio::task::spawn_blocking(move || this.materialize_sync(&declared, &result, &staging_dir))
            .await
            .map_err(|e| MaterializeError::Archive(format!("materialization task failed: {}", e)))?
    }

    /// Copy or link every final output into the workflow's output directory
    pub async fn publish_final_outputs(
        &self,
        definition: &WorkflowDefinition,
    ) -> Result<Vec<PathBuf>, MaterializeError> {
        let mut pairs = Vec::with_capacity(definition.final_outputs().len());
        for name in definition.final_outputs().keys() {
            let source = definition
                .final_output_source(name)
                .map_err(|_| MaterializeError::MissingOutput(name.clone()))?;
            let target = definition
                .final_output_path(name)
                .map_err(|_| MaterializeError::MissingOutput(name.clone()))?;
            pairs.push((name.clone(), source, target));
        }

        let this = *self;
        tokio::task::spawn_blocking(move || {
            let mut published = Vec::with_capacity(pairs.len());
            for (name, source, target) in pairs {
                if !source.is_file() {
                    return Err(MaterializeError::MissingOutput(name));
                }
                this.place(&source, &target)?;
                published.push(target);
            }
            Ok(published)
        })
        .await
        .map_err(|e| MaterializeError::Archive(format!("publish task failed: {}", e)))?
    }

    pub fn materialize_sync(
        &self,
        declared: &[String],
        result: &ResultContext,
        staging_dir: &Path,
    ) -> Result<Vec<PathBuf>, MaterializeError> {
        fs::create_dir_all(staging_dir).map_err(|e| MaterializeError::io(staging_dir, e))?;
        if declared.is_empty() {
            return Ok(Vec::new());
        }

        if let Some(dir) = result.get(OUTPUT_DIR_KEY) {
            self.from_directory(declared, Path::new(dir), staging_dir)
        } else if let Some(archive) = result.get(OUTPUT_ARCHIVE_KEY) {
            from_tar_gz(declared, Path::new(archive), staging_dir)
        } else if let Some(archive) = result.get(OUTPUT_ZIP_KEY) {
            from_zip(declared, Path::new(archive), staging_dir)
        } else {
            Err(MaterializeError::MissingResultLocation)
        }
    }

    fn from_directory(
        &self,
        declared: &[String],
        source_dir: &Path,
        staging_dir: &Path,
    ) -> Result<Vec<PathBuf>, MaterializeError> {
        let mut placed = Vec::with_capacity(declared.len());
        for output in declared {
            let source = source_dir.join(output);
            if !source.is_file() {
                return Err(MaterializeError::MissingOutput(output.clone()));
            }
            let target = staging_dir.join(output);
            self.place(&source, &target)?;
            placed.push(target);
        }
        Ok(placed)
    }

    /// Hard link when allowed and possible, copy otherwise
    fn place(&self, source: &Path, target: &Path) -> Result<(), MaterializeError> {
        prepare_target(target)?;

        if self.prefer_links {
            match fs::hard_link(source, target) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::debug!(
                        "Hard link failed, copying instead: source={}, target={}, error={}",
                        source.display(),
                        target.display(),
                        e
                    );
                }
            }
        }

        fs::copy(source, target).map_err(|e| MaterializeError::io(target, e))?;
        Ok(())
    }
}

impl Default for OutputMaterializer {
    fn default() -> Self {
        Self::new(true)
    }
}

fn from_tar_gz(
    declared: &[String],
    archive_path: &Path,
    staging_dir: &Path,
) -> Result<Vec<PathBuf>, MaterializeError> {
    let file = fs::File::open(archive_path).map_err(|e| MaterializeError::io(archive_path, e))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    let wanted = wanted_outputs(declared);
    let mut placed = Vec::with_capacity(declared.len());
    let mut found = HashSet::new();

    let entries = archive
        .entries()
        .map_err(|e| MaterializeError::Archive(format!("read {:?}: {}", archive_path, e)))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|e| MaterializeError::Archive(format!("tar entry: {}", e)))?;
        let entry_path = normalize(
            &entry
                .path()
                .map_err(|e| MaterializeError::Archive(format!("tar entry path: {}", e)))?,
        );

        if !wanted.contains(&entry_path) || !found.insert(entry_path.clone()) {
            continue;
        }

        let target = staging_dir.join(&entry_path);
        prepare_target(&target)?;
        entry
            .unpack(&target)
            .map_err(|e| MaterializeError::io(&target, e))?;
        placed.push(target);
    }

    ensure_all_found(declared, &found)?;
    Ok(placed)
}

fn from_zip(
    declared: &[String],
    archive_path: &Path,
    staging_dir: &Path,
) -> Result<Vec<PathBuf>, MaterializeError> {
    let file = fs::File::open(archive_path).map_err(|e| MaterializeError::io(archive_path, e))?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| MaterializeError::Archive(format!("read zip {:?}: {}", archive_path, e)))?;
    let wanted = wanted_outputs(declared);
    let mut placed = Vec::with_capacity(declared.len());
    let mut found = HashSet::new();

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| MaterializeError::Archive(format!("zip entry {}: {}", i, e)))?;
        if entry.is_dir() {
            continue;
        }
        let Some(entry_path) = entry.enclosed_name().map(|p| normalize(&p)) else {
            continue;
        };
        if !wanted.contains(&entry_path) || !found.insert(entry_path.clone()) {
            continue;
        }

        let target = staging_dir.join(&entry_path);
        prepare_target(&target)?;
        let mut out = fs::File::create(&target).map_err(|e| MaterializeError::io(&target, e))?;
        std::io::copy(&mut entry, &mut out).map_err(|e| MaterializeError::io(&target, e))?;
        placed.push(target);
    }

    ensure_all_found(declared, &found)?;
    Ok(placed)
}

fn wanted_outputs(declared: &[String]) -> HashSet<PathBuf> {
    declared.iter().map(|o| normalize(Path::new(o))).collect()
}

fn ensure_all_found(declared: &[String], found: &HashSet<PathBuf>) -> Result<(), MaterializeError> {
    match declared
        .iter()
        .find(|o| !found.contains(&normalize(Path::new(o))))
    {
        Some(missing) => Err(MaterializeError::MissingOutput(missing.clone())),
        None => Ok(()),
    }
}

/// Drop `.` components so `./a.txt` and `a.txt` compare equal
fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

/// Create parent directories and clear a stale target from an earlier attempt
fn prepare_target(target: &Path) -> Result<(), MaterializeError> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|e| MaterializeError::io(parent, e))?;
    }
    match fs::remove_file(target) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(MaterializeError::io(target, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::TempDir;

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn declared(outputs: &[&str]) -> Vec<String> {
        outputs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_directory_outputs_are_linked() {
        let temp_dir = TempDir::new().unwrap();
        let work = temp_dir.path().join("work");
        let staging = temp_dir.path().join("staging");
        write(&work.join("a1.txt"), "one");
        write(&work.join("nested/a2.txt"), "two");
        write(&work.join("scratch.tmp"), "ignored");

        let placed = OutputMaterializer::new(true)
            .materialize_sync(
                &declared(&["a1.txt", "nested/a2.txt"]),
                &ResultContext::output_dir(&work),
                &staging,
            )
            .unwrap();

        assert_eq!(placed.len(), 2);
        assert_eq!(fs::read_to_string(staging.join("a1.txt")).unwrap(), "one");
        assert_eq!(fs::read_to_string(staging.join("nested/a2.txt")).unwrap(), "two");
        assert!(!staging.join("scratch.tmp").exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            let src = fs::metadata(work.join("a1.txt")).unwrap();
            let dst = fs::metadata(staging.join("a1.txt")).unwrap();
            assert_eq!(src.ino(), dst.ino());
        }
    }

    #[test]
    fn test_copy_mode_and_rerun_overwrites() {
        let temp_dir = TempDir::new().unwrap();
        let work = temp_dir.path().join("work");
        let staging = temp_dir.path().join("staging");
        write(&work.join("out.txt"), "fresh");
        write(&staging.join("out.txt"), "stale");

        OutputMaterializer::new(false)
            .materialize_sync(&declared(&["out.txt"]), &ResultContext::output_dir(&work), &staging)
            .unwrap();
        assert_eq!(fs::read_to_string(staging.join("out.txt")).unwrap(), "fresh");
    }

    #[test]
    fn test_missing_output_fails() {
        let temp_dir = TempDir::new().unwrap();
        let work = temp_dir.path().join("work");
        fs::create_dir_all(&work).unwrap();

        let err = OutputMaterializer::default()
            .materialize_sync(
                &declared(&["absent.txt"]),
                &ResultContext::output_dir(&work),
                &temp_dir.path().join("staging"),
            )
            .unwrap_err();
        assert!(matches!(err, MaterializeError::MissingOutput(o) if o == "absent.txt"));
    }

    #[test]
    fn test_missing_location_fails_only_with_declared_outputs() {
        let temp_dir = TempDir::new().unwrap();
        let staging = temp_dir.path().join("staging");
        let materializer = OutputMaterializer::default();

        assert!(materializer
            .materialize_sync(&[], &ResultContext::new(), &staging)
            .unwrap()
            .is_empty());
        assert!(staging.is_dir());

        let err = materializer
            .materialize_sync(&declared(&["a.txt"]), &ResultContext::new(), &staging)
            .unwrap_err();
        assert!(matches!(err, MaterializeError::MissingResultLocation));
    }

    #[test]
    fn test_tar_gz_archive() {
        let temp_dir = TempDir::new().unwrap();
        let archive_path = temp_dir.path().join("out.tar.gz");
        {
            let file = fs::File::create(&archive_path).unwrap();
            let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
            for (name, content) in [("./a.txt", "alpha"), ("sub/b.txt", "beta"), ("c.txt", "gamma")] {
                let mut header = tar::Header::new_gnu();
                header.set_size(content.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();
                builder.append_data(&mut header, name, content.as_bytes()).unwrap();
            }
            builder.into_inner().unwrap().finish().unwrap();
        }

        let staging = temp_dir.path().join("staging");
        let placed = OutputMaterializer::default()
            .materialize_sync(
                &declared(&["a.txt", "sub/b.txt"]),
                &ResultContext::output_archive(&archive_path),
                &staging,
            )
            .unwrap();

        assert_eq!(placed.len(), 2);
        assert_eq!(fs::read_to_string(staging.join("a.txt")).unwrap(), "alpha");
        assert_eq!(fs::read_to_string(staging.join("sub/b.txt")).unwrap(), "beta");
        assert!(!staging.join("c.txt").exists());

        let err = OutputMaterializer::default()
            .materialize_sync(
                &declared(&["missing.txt"]),
                &ResultContext::output_archive(&archive_path),
                &staging,
            )
            .unwrap_err();
        assert!(matches!(err, MaterializeError::MissingOutput(_)));
    }

    #[test]
    fn test_zip_archive() {
        let temp_dir = TempDir::new().unwrap();
        let archive_path = temp_dir.path().join("out.zip");
        {
            let file = fs::File::create(&archive_path).unwrap();
            let mut writer = zip::ZipWriter::new(file);
            let options = zip::write::SimpleFileOptions::default();
            writer.start_file("report.csv", options).unwrap();
            writer.write_all(b"x,y\n1,2\n").unwrap();
            writer.finish().unwrap();
        }

        let staging = temp_dir.path().join("staging");
        OutputMaterializer::default()
            .materialize_sync(
                &declared(&["report.csv"]),
                &ResultContext::output_zip(&archive_path),
                &staging,
            )
            .unwrap();
        assert_eq!(fs::read_to_string(staging.join("report.csv")).unwrap(), "x,y\n1,2\n");
    }
}
