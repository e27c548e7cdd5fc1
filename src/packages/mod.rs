// src/packages/mod.rs

//! The package repository contract.
//!
//! The engine never talks to a package manager directly: everything goes
//! through a [`PackageRepository`] provided by the embedding application.
//! Methods invoked by the overlay manager run with the mounted overlay
//! tree as the filesystem root.

use crate::error::Result;
use std::path::Path;

/// Adapter to the system package repository.
pub trait PackageRepository {
    /// Download the named stage packages into `stage_packages_path`.
    ///
    /// Returns the resolved package list, including dependencies.
    fn fetch_stage_packages(
        &self,
        cache_dir: &Path,
        package_names: &[String],
        arch: &str,
        stage_packages_path: &Path,
    ) -> Result<Vec<String>>;

    /// Extract previously fetched stage packages into `install_path`.
    ///
    /// When `track` is set, extracted files are annotated with their
    /// originating package so `read_origin_stage_package` can recover it.
    fn unpack_stage_packages(
        &self,
        stage_packages_path: &Path,
        install_path: &Path,
        stage_packages: Option<&[String]>,
        track: bool,
    ) -> Result<()>;

    /// Download the named snap-style packages into `directory`.
    fn fetch_stage_snaps(&self, _snaps: &[String], _directory: &Path) -> Result<()> {
        Ok(())
    }

    /// Extract previously fetched snap-style packages into `install_dir`.
    fn unpack_stage_snaps(&self, _snaps_dir: &Path, _install_dir: &Path) -> Result<()> {
        Ok(())
    }

    /// Update the list of available packages.
    fn refresh_packages_list(&self) -> Result<()>;

    /// Download the named packages to the local system.
    fn fetch_packages(&self, package_names: &[String]) -> Result<Vec<String>>;

    /// Install the named packages on the local system.
    fn install_packages(&self, package_names: &[String]) -> Result<Vec<String>>;

    /// Install packages required to build the project.
    fn install_build_packages(&self, package_names: &[String]) -> Result<Vec<String>> {
        self.install_packages(package_names)
    }

    /// The packages currently installed on the local system.
    fn get_installed_packages(&self) -> Result<Vec<String>>;

    /// Packages required to handle the given source type.
    fn get_packages_for_source_type(&self, _source_type: &str) -> Vec<String> {
        Vec::new()
    }

    /// The stage package that provided `path`, if tracked.
    fn read_origin_stage_package(&self, path: &Path) -> Result<Option<String>>;
}

/// A repository adapter that provides no packages.
///
/// Used when the embedding application does not configure one; declaring
/// stage or overlay packages with this adapter fails at fetch time.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRepository;

impl PackageRepository for NullRepository {
    fn fetch_stage_packages(
        &self,
        _cache_dir: &Path,
        package_names: &[String],
        _arch: &str,
        _stage_packages_path: &Path,
    ) -> Result<Vec<String>> {
        match package_names.first() {
            Some(name) => Err(crate::error::Error::PackageNotFound(name.clone())),
            None => Ok(Vec::new()),
        }
    }

    fn unpack_stage_packages(
        &self,
        _stage_packages_path: &Path,
        _install_path: &Path,
        _stage_packages: Option<&[String]>,
        _track: bool,
    ) -> Result<()> {
        Ok(())
    }

    fn refresh_packages_list(&self) -> Result<()> {
        Ok(())
    }

    fn fetch_packages(&self, package_names: &[String]) -> Result<Vec<String>> {
        match package_names.first() {
            Some(name) => Err(crate::error::Error::PackageNotFound(name.clone())),
            None => Ok(Vec::new()),
        }
    }

    fn install_packages(&self, package_names: &[String]) -> Result<Vec<String>> {
        match package_names.first() {
            Some(name) => Err(crate::error::Error::PackageNotFound(name.clone())),
            None => Ok(Vec::new()),
        }
    }

    fn install_build_packages(&self, _package_names: &[String]) -> Result<Vec<String>> {
        // build tooling is the host's concern on systems without a
        // package repository adapter
        Ok(Vec::new())
    }

    fn get_installed_packages(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn read_origin_stage_package(&self, _path: &Path) -> Result<Option<String>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_null_repository_rejects_fetches() {
        let repo = NullRepository;
        let err = repo.fetch_packages(&["hello".to_string()]).unwrap_err();
        assert!(matches!(err, Error::PackageNotFound(name) if name == "hello"));
    }

    #[test]
    fn test_null_repository_accepts_empty_requests() {
        let repo = NullRepository;
        assert!(repo.fetch_packages(&[]).unwrap().is_empty());
        assert!(repo.get_installed_packages().unwrap().is_empty());
        assert!(repo
            .read_origin_stage_package(Path::new("/x"))
            .unwrap()
            .is_none());
    }
}
