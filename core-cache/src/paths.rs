//! Path mapping and admission filters
//!
//! Media-server paths are rewritten through the configured prefix map, then
//! normalised lexically. The result must lie under the slow pool root; the
//! cache path is the same relative path under the fast pool root. Nothing in
//! here touches the filesystem.

use crate::error::{CacheError, Result};
use core_runtime::{EngineConfig, PathMapping};
use std::path::{Component, Path, PathBuf};

/// Slow/fast location pair of one media file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedPaths {
    pub source_path: PathBuf,
    pub cache_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct PathMapper {
    slow_root: PathBuf,
    fast_root: PathBuf,
    path_map: Vec<PathMapping>,
    allowed_extensions: Vec<String>,
    exclude_patterns: Vec<String>,
}

impl PathMapper {
    pub fn new(config: &EngineConfig) -> Self {
        let mut path_map = config.path_map.clone();
        // Longest prefix wins
        path_map.sort_by(|a, b| b.from.len().cmp(&a.from.len()));

        Self {
            slow_root: normalize(&config.slow_root).unwrap_or_else(|| config.slow_root.clone()),
            fast_root: normalize(&config.fast_root).unwrap_or_else(|| config.fast_root.clone()),
            path_map,
            allowed_extensions: config
                .allowed_extensions
                .iter()
                .map(|ext| {
                    let ext = ext.trim().to_ascii_lowercase();
                    if ext.starts_with('.') {
                        ext
                    } else {
                        format!(".{}", ext)
                    }
                })
                .collect(),
            exclude_patterns: config
                .exclude_patterns
                .iter()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn slow_root(&self) -> &Path {
        &self.slow_root
    }

    pub fn fast_root(&self) -> &Path {
        &self.fast_root
    }

    /// Map a media-server path to its slow and fast pool locations.
    ///
    /// # Errors
    /// [`CacheError::PathTraversal`] when the mapped path is relative or
    /// escapes the slow pool root.
    pub fn map(&self, media_path: &Path) -> Result<MappedPaths> {
        let rewritten = self.rewrite(media_path);
        let source_path = normalize(&rewritten)
            .ok_or_else(|| CacheError::PathTraversal(media_path.display().to_string()))?;

        let relative = source_path
            .strip_prefix(&self.slow_root)
            .map_err(|_| CacheError::PathTraversal(media_path.display().to_string()))?;
        if relative.as_os_str().is_empty() {
            return Err(CacheError::PathTraversal(media_path.display().to_string()));
        }

        let cache_path = self.fast_root.join(relative);
        Ok(MappedPaths {
            source_path,
            cache_path,
        })
    }

    fn rewrite(&self, media_path: &Path) -> PathBuf {
        for mapping in &self.path_map {
            if let Ok(rest) = media_path.strip_prefix(&mapping.from) {
                return if rest.as_os_str().is_empty() {
                    mapping.to.clone()
                } else {
                    mapping.to.join(rest)
                };
            }
        }
        media_path.to_path_buf()
    }

    /// Whether the path carries an admitted media extension
    pub fn has_allowed_extension(&self, path: &Path) -> bool {
        let name = match path.file_name() {
            Some(name) => name.to_string_lossy().to_ascii_lowercase(),
            None => return false,
        };
        self.allowed_extensions.iter().any(|ext| name.ends_with(ext.as_str()))
    }

    /// First exclude pattern contained in the path
    pub fn excluded_by(&self, path: &Path) -> Option<&str> {
        let text = path.to_string_lossy();
        self.exclude_patterns
            .iter()
            .find(|pattern| text.contains(pattern.as_str()))
            .map(String::as_str)
    }

    pub fn is_under_fast_root(&self, path: &Path) -> bool {
        normalize(path).is_some_and(|p| p.starts_with(&self.fast_root) && p != self.fast_root)
    }
}

/// Resolve `.` and `..` lexically.
///
/// Returns `None` for relative paths and for paths that climb above `/`.
pub fn normalize(path: &Path) -> Option<PathBuf> {
    if !path.is_absolute() {
        return None;
    }
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::RootDir | Component::Prefix(_) => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() || out.as_os_str().is_empty() {
                    return None;
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper() -> PathMapper {
        let config = EngineConfig::new("/mnt/user0", "/mnt/cache")
            .with_path_map(vec![
                PathMapping::new("/media", "/mnt/user0"),
                PathMapping::new("/media/tv", "/mnt/user0/Series"),
            ])
            .with_exclude_patterns(vec!["/extras/".to_string()]);
        PathMapper::new(&config)
    }

    #[test]
    fn test_maps_through_longest_prefix() {
        let mapped = mapper().map(Path::new("/media/tv/Show/S01E01.mkv")).unwrap();
        assert_eq!(
            mapped.source_path,
            PathBuf::from("/mnt/user0/Series/Show/S01E01.mkv")
        );
        assert_eq!(
            mapped.cache_path,
            PathBuf::from("/mnt/cache/Series/Show/S01E01.mkv")
        );
    }

    #[test]
    fn test_prefix_matches_whole_components() {
        let err = mapper().map(Path::new("/media2/a.mkv")).unwrap_err();
        assert!(matches!(err, CacheError::PathTraversal(_)));
    }

    #[test]
    fn test_host_paths_pass_through() {
        let mapped = mapper().map(Path::new("/mnt/user0/Movies/A (2020)/a.mkv")).unwrap();
        assert_eq!(
            mapped.cache_path,
            PathBuf::from("/mnt/cache/Movies/A (2020)/a.mkv")
        );
    }

    #[test]
    fn test_rejects_traversal() {
        let mapper = mapper();
        for path in [
            "/media/../etc/passwd",
            "/mnt/user0/../cache/a.mkv",
            "relative/a.mkv",
            "/../../a.mkv",
            "/mnt/user0",
        ] {
            let err = mapper.map(Path::new(path)).unwrap_err();
            assert!(matches!(err, CacheError::PathTraversal(_)), "{}", path);
        }
    }

    #[test]
    fn test_dot_segments_inside_root_are_allowed() {
        let mapped = mapper()
            .map(Path::new("/mnt/user0/Movies/./x/../a.mkv"))
            .unwrap();
        assert_eq!(mapped.source_path, PathBuf::from("/mnt/user0/Movies/a.mkv"));
    }

    #[test]
    fn test_admission_filters() {
        let mapper = mapper();
        assert!(mapper.has_allowed_extension(Path::new("/a/B.MKV")));
        assert!(mapper.has_allowed_extension(Path::new("/a/b.ts")));
        assert!(!mapper.has_allowed_extension(Path::new("/a/b.srt")));
        assert!(!mapper.has_allowed_extension(Path::new("/a/mkv")));
        assert_eq!(
            mapper.excluded_by(Path::new("/mnt/user0/Movies/extras.mkv")),
            None
        );
        assert_eq!(
            mapper.excluded_by(Path::new("/mnt/user0/Movies/A/extras/a.mkv")),
            Some("/extras/")
        );
    }

    #[test]
    fn test_extensions_without_dot_are_normalised() {
        let mut config = EngineConfig::new("/slow", "/fast");
        config.allowed_extensions = vec!["MKV".to_string()];
        let mapper = PathMapper::new(&config);
        assert!(mapper.has_allowed_extension(Path::new("/slow/a.mkv")));
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(Path::new("/a/./b/../c")), Some(PathBuf::from("/a/c")));
        assert_eq!(normalize(Path::new("/..")), None);
        assert_eq!(normalize(Path::new("a/b")), None);
        assert!(mapper().is_under_fast_root(Path::new("/mnt/cache/x.partial")));
        assert!(!mapper().is_under_fast_root(Path::new("/mnt/cache")));
    }
}
