use std::env;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

const ORT_DYLIB_ENV: &str = "ORT_DYLIB_PATH";

#[cfg(all(unix, not(target_os = "macos")))]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(target_os = "macos")]
const ORT_LIB_NAME: &str = "libonnxruntime.dylib";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

/// Search directories relative to the current executable for the ONNX
/// Runtime shared library.
///
/// Searches these locations in order:
///   1. `<exe_dir>/` (Windows only)
///   2. `<exe_dir>/lib/`
///   3. `<exe_dir>/../lib/`
///   4. `<cwd>/lib/`
///   5. `/usr/local/lib/` (Unix only)
///   6. `/usr/lib/` (Unix only)
fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            #[cfg(windows)]
            {
                dirs.push(exe_dir.to_path_buf());
            }
            dirs.push(exe_dir.join("lib"));
            if let Some(parent) = exe_dir.parent() {
                dirs.push(parent.join("lib"));
            }
        }
    }
    if let Ok(cwd) = env::current_dir() {
        let cwd_lib = cwd.join("lib");
        if !dirs.contains(&cwd_lib) {
            dirs.push(cwd_lib);
        }
    }
    #[cfg(unix)]
    {
        dirs.push(PathBuf::from("/usr/local/lib"));
        dirs.push(PathBuf::from("/usr/lib"));
    }
    dirs
}

fn find_ort_dylib_in_dirs(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

/// Point `ort` at a bundled ONNX Runtime library unless the environment
/// already does.
///
/// Call this at the very start of `main()`, before any session is built.
pub fn setup_runtime_libs() {
    if env::var_os(ORT_DYLIB_ENV).is_some() {
        return;
    }
    if let Some(path) = find_ort_dylib_in_dirs(&candidate_lib_dirs()) {
        env::set_var(ORT_DYLIB_ENV, &path);
    }
}

/// Log which runtime library was resolved. Call after tracing is initialized.
pub fn log_runtime_lib_status() {
    match env::var(ORT_DYLIB_ENV) {
        Ok(ort) if Path::new(&ort).is_file() => info!("ORT library: {ort}"),
        Ok(ort) => warn!("{ORT_DYLIB_ENV} set to {ort} but file not found"),
        Err(_) => info!(
            "{ORT_DYLIB_ENV} not set; the onnx backbone will use the default search paths"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn candidate_lib_dirs_contains_system_paths() {
        let dirs = candidate_lib_dirs();
        assert!(dirs.contains(&PathBuf::from("/usr/local/lib")));
        assert!(dirs.contains(&PathBuf::from("/usr/lib")));
    }

    #[test]
    fn candidate_lib_dirs_includes_cwd_lib() {
        let dirs = candidate_lib_dirs();
        if let Ok(cwd) = env::current_dir() {
            assert!(dirs.contains(&cwd.join("lib")));
        }
    }

    #[test]
    fn find_ort_dylib_prefers_first_match() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        let first = temp.path().join("first");
        let second = temp.path().join("second");
        std::fs::create_dir_all(&first).expect("first dir should be created");
        std::fs::create_dir_all(&second).expect("second dir should be created");
        std::fs::write(first.join(ORT_LIB_NAME), b"first").expect("first lib should exist");
        std::fs::write(second.join(ORT_LIB_NAME), b"second").expect("second lib should exist");

        let resolved = find_ort_dylib_in_dirs(&[first.clone(), second])
            .expect("library should be resolved");
        assert_eq!(resolved, first.join(ORT_LIB_NAME));
    }

    #[test]
    fn find_ort_dylib_skips_directories_without_library() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        assert_eq!(find_ort_dylib_in_dirs(&[temp.path().to_path_buf()]), None);
    }
}
