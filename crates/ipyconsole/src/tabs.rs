//! Tab titles for file-bound consoles.

use std::path::{Component, Path};

fn components(path: &Path) -> Vec<String> {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect()
}

/// Shortest trailing part of `path` that no other path in `open` shares.
///
/// With a unique basename this is the basename itself. Paths equal to
/// `path` do not count as conflicts.
pub fn disambiguate(path: &Path, open: &[&Path]) -> String {
    let own = components(path);
    let Some(basename) = own.last() else {
        return path.display().to_string();
    };
    let others: Vec<Vec<String>> = open
        .iter()
        .filter(|p| **p != path)
        .map(|p| components(p))
        .filter(|c| c.last() == Some(basename))
        .collect();

    for len in 1..=own.len() {
        let suffix = &own[own.len() - len..];
        let shared = others
            .iter()
            .any(|other| other.len() >= len && other[other.len() - len..] == *suffix);
        if !shared {
            return suffix.join("/");
        }
    }
    own.join("/")
}

/// Titles for every entry of `paths`, in order. `None` entries are
/// consoles not bound to a file.
pub fn tab_titles(paths: &[Option<&Path>]) -> Vec<Option<String>> {
    let open: Vec<&Path> = paths.iter().flatten().copied().collect();
    paths
        .iter()
        .map(|p| p.map(|p| disambiguate(p, &open)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_basename() {
        let a = Path::new("/home/u/proj/main.py");
        let b = Path::new("/home/u/proj/util.py");
        assert_eq!(disambiguate(a, &[a, b]), "main.py");
    }

    #[test]
    fn test_shortest_distinguishing_suffix() {
        let a = Path::new("/home/u/one/src/main.py");
        let b = Path::new("/home/u/two/src/main.py");
        let c = Path::new("/home/u/two/lib/main.py");
        let open = [a, b, c];
        assert_eq!(disambiguate(a, &open), "one/src/main.py");
        assert_eq!(disambiguate(b, &open), "two/src/main.py");
        assert_eq!(disambiguate(c, &open), "lib/main.py");
    }

    #[test]
    fn test_titles_recomputed_on_remove() {
        let a = Path::new("/x/a/run.py");
        let b = Path::new("/x/b/run.py");
        assert_eq!(
            tab_titles(&[Some(a), None, Some(b)]),
            vec![
                Some("a/run.py".to_string()),
                None,
                Some("b/run.py".to_string())
            ]
        );
        assert_eq!(tab_titles(&[Some(a)]), vec![Some("run.py".to_string())]);
    }
}
