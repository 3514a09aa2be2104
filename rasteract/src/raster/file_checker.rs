//! FileChecker (spec §4.13): validates whether a cache tile's on-disk file
//! exists and matches what it claims to be. Holds no persistent state;
//! completion is routed straight to `CacheSupervisor`.

use std::path::PathBuf;

use crate::cache_format;
use crate::descriptor::DType;
use crate::error::CacheError;
use crate::ids::JobId;
use crate::message::{Address, Envelope, Payload};
use crate::pool::{PoolJob, PoolMsg, PoolOutcome, WaitingClass};

use super::RasterMsg;

#[derive(Debug)]
pub enum FileCheckerMsg {
    CheckThisCacheTile {
        cache_key: (i64, i64),
        cache_dir: PathBuf,
        fname_prefix: String,
        expected_width: u32,
        expected_height: u32,
        expected_channels: u32,
        expected_dtype: DType,
    },
}

/// Result of probing one cache tile's directory entry (spec §4.13).
#[derive(Debug)]
pub enum CheckStatus {
    Found { cache_key: (i64, i64), path: PathBuf },
    Absent { cache_key: (i64, i64) },
}

#[derive(Default)]
pub struct FileChecker;

impl FileChecker {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&mut self, msg: FileCheckerMsg, raster_uid: u64, pool: Option<crate::pool::PoolId>) -> Vec<Envelope> {
        let FileCheckerMsg::CheckThisCacheTile {
            cache_key,
            cache_dir,
            fname_prefix,
            expected_width,
            expected_height,
            expected_channels,
            expected_dtype,
        } = msg;
        let job_id = JobId::next();
        let run = move || -> PoolOutcome {
            let result = check_dir(
                &cache_dir,
                &fname_prefix,
                expected_width,
                expected_height,
                expected_channels,
                expected_dtype,
            );
            // On any failure short of an I/O error probing the directory
            // itself, the file is corrupt or stale: delete it and report
            // the tile absent so it gets recomputed (spec §4.13/§7 "On any
            // failure, delete the file and report absent").
            let status = match result {
                Ok(Some(path)) => Ok(CheckStatus::Found { cache_key, path }),
                Ok(None) => Ok(CheckStatus::Absent { cache_key }),
                Err(e) => match e.path() {
                    Some(path) => {
                        if let Err(remove_err) = std::fs::remove_file(path) {
                            if remove_err.kind() != std::io::ErrorKind::NotFound {
                                tracing::warn!(path = ?path, error = %remove_err, "failed to delete corrupt cache file");
                            }
                        }
                        tracing::warn!(path = ?path, error = %e, "deleted corrupt cache file, reporting absent");
                        Ok(CheckStatus::Absent { cache_key })
                    }
                    None => Err(e),
                },
            };
            PoolOutcome::Checked(status)
        };
        let job = PoolJob {
            id: job_id,
            class: WaitingClass::MaxPriority,
            origin: Address::Raster(raster_uid),
            run: Box::new(run),
        };
        match pool {
            Some(pool_id) => vec![Envelope::basic(
                Address::Pool(pool_id),
                Payload::Pool(PoolMsg::WaitingRoom(crate::pool::WaitingRoomMsg::NewJob(job))),
            )],
            None => {
                let outcome = (job.run)();
                vec![Envelope::basic(
                    Address::Raster(raster_uid),
                    Payload::Raster(RasterMsg::PoolJobDone(crate::pool::JobDone { job_id, outcome })),
                )]
            }
        }
    }
}

/// Scans `cache_dir` for files named `<prefix>_<hex16>.rstc`. Zero matches
/// is absence; exactly one match is read back and verified against the
/// filename digest plus the shape/dtype/band-count invariants (spec §4.13,
/// §7 "Cache file corruption/inconsistency"); more than one match is an
/// ambiguity that is never resolved by reading — every candidate is deleted
/// and the tile is reported absent (spec §4.9 "Unknown" transition).
fn check_dir(
    cache_dir: &std::path::Path,
    prefix: &str,
    expected_width: u32,
    expected_height: u32,
    expected_channels: u32,
    expected_dtype: DType,
) -> Result<Option<PathBuf>, CacheError> {
    let needle = format!("{prefix}_");
    let entries = match std::fs::read_dir(cache_dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(CacheError::Io {
                path: cache_dir.to_path_buf(),
                source,
            })
        }
    };
    let mut candidates = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| CacheError::Io {
            path: cache_dir.to_path_buf(),
            source,
        })?;
        let name = entry.file_name();
        let name = name.to_string_lossy().into_owned();
        if !name.starts_with(&needle) || !name.ends_with(".rstc") {
            continue;
        }
        candidates.push(entry.path());
    }

    if candidates.len() > 1 {
        for path in &candidates {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = ?path, error = %e, "failed to delete ambiguous cache file");
                }
            }
        }
        tracing::warn!(dir = ?cache_dir, prefix, count = candidates.len(), "multiple cache files for one tile, treating as absent");
        return Ok(None);
    }
    let Some(path) = candidates.into_iter().next() else {
        return Ok(None);
    };

    let Some(name) = path.file_name() else {
        return Err(CacheError::MalformedFilename { path });
    };
    let name = name.to_string_lossy().into_owned();
    let digest_str = name.trim_start_matches(&needle).trim_end_matches(".rstc");
    let claimed = u64::from_str_radix(digest_str, 16)
        .map_err(|_| CacheError::MalformedFilename { path: path.clone() })?;

    let decoded = cache_format::read_from(&path).map_err(|e| match e {
        cache_format::DecodeError::Io(source) => CacheError::Io {
            path: path.clone(),
            source,
        },
        _ => CacheError::MalformedFilename { path: path.clone() },
    })?;

    if decoded.header.width != expected_width || decoded.header.height != expected_height {
        return Err(CacheError::FootprintMismatch { path });
    }
    if decoded.header.channels != expected_channels {
        return Err(CacheError::BandCountMismatch {
            path,
            found: decoded.header.channels,
            expected: expected_channels,
        });
    }
    if decoded.header.dtype != expected_dtype {
        return Err(CacheError::DtypeMismatch {
            path,
            found: decoded.header.dtype.to_string(),
            expected: expected_dtype.to_string(),
        });
    }
    if decoded.checksum != claimed {
        return Err(CacheError::ChecksumMismatch {
            path,
            found: format!("{:016x}", decoded.checksum),
            expected: digest_str.to_string(),
        });
    }
    Ok(Some(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_format::CacheFileHeader;

    #[test]
    fn finds_and_validates_a_matching_file() {
        let dir = tempfile::tempdir().unwrap();
        let header = CacheFileHeader {
            width: 2,
            height: 2,
            channels: 1,
            dtype: DType::F32,
        };
        let data = vec![1.0f32, 2.0, 3.0, 4.0];
        let checksum = cache_format::checksum64(
            &data.iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<u8>>(),
        );
        let path = dir.path().join(cache_format::filename("tile", checksum));
        cache_format::write_to(&path, &header, &data).unwrap();

        let found = check_dir(dir.path(), "tile", 2, 2, 1, DType::F32).unwrap();
        assert_eq!(found, Some(path));
    }

    #[test]
    fn missing_directory_is_absent_not_an_error() {
        let found = check_dir(std::path::Path::new("/nonexistent/rasteract"), "tile", 2, 2, 1, DType::F32).unwrap();
        assert_eq!(found, None);
    }

    #[test]
    fn checksum_mismatch_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let header = CacheFileHeader {
            width: 2,
            height: 2,
            channels: 1,
            dtype: DType::F32,
        };
        let data = vec![1.0f32, 2.0, 3.0, 4.0];
        let path = dir.path().join(cache_format::filename("tile", 0xDEAD_BEEF));
        cache_format::write_to(&path, &header, &data).unwrap();

        let err = check_dir(dir.path(), "tile", 2, 2, 1, DType::F32).unwrap_err();
        assert!(matches!(err, CacheError::ChecksumMismatch { .. }));
    }

    #[test]
    fn multiple_candidates_are_deleted_and_reported_absent() {
        let dir = tempfile::tempdir().unwrap();
        let header = CacheFileHeader {
            width: 2,
            height: 2,
            channels: 1,
            dtype: DType::F32,
        };
        let data = vec![1.0f32, 2.0, 3.0, 4.0];
        let path_a = dir.path().join(cache_format::filename("tile", 0x1111));
        let path_b = dir.path().join(cache_format::filename("tile", 0x2222));
        cache_format::write_to(&path_a, &header, &data).unwrap();
        cache_format::write_to(&path_b, &header, &data).unwrap();

        let found = check_dir(dir.path(), "tile", 2, 2, 1, DType::F32).unwrap();
        assert_eq!(found, None);
        assert!(!path_a.exists());
        assert!(!path_b.exists());
    }
}
