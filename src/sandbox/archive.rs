//! 文件集 ↔ tar 包
//!
//! 写入的条目元数据固定（mtime=0、uid/gid=0、0644），同样的文件集得到同样的字节。

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Component, Path};

use tar::{Archive, Builder, EntryType, Header};

/// 把文件集打成 tar（父目录单独建条目）
pub fn build_archive(files: &BTreeMap<String, String>) -> io::Result<Vec<u8>> {
    let mut dirs = BTreeSet::new();
    for name in files.keys() {
        check_relative(name)?;
        let mut parent = Path::new(name).parent();
        while let Some(p) = parent {
            if p.as_os_str().is_empty() {
                break;
            }
            dirs.insert(p.to_path_buf());
            parent = p.parent();
        }
    }

    let mut builder = Builder::new(Vec::new());
    for dir in &dirs {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Directory);
        header.set_size(0);
        header.set_mode(0o755);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(0);
        header.set_cksum();
        builder.append_data(&mut header, dir, io::empty())?;
    }
    for (name, content) in files {
        let bytes = content.as_bytes();
        let mut header = Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(0);
        header.set_cksum();
        builder.append_data(&mut header, name, bytes)?;
    }
    builder.into_inner()
}

/// 解包到 dest；越界路径由 tar 的 unpack_in 拒绝
pub fn extract_archive(bytes: &[u8], dest: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dest)?;
    let mut archive = Archive::new(bytes);
    for entry in archive.entries()? {
        let mut entry = entry?;
        entry.unpack_in(dest)?;
    }
    Ok(())
}

fn check_relative(name: &str) -> io::Result<()> {
    let path = Path::new(name);
    let ok = !name.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if ok {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid file name '{name}'"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(v: &[(&str, &str)]) -> BTreeMap<String, String> {
        v.iter().map(|(k, c)| (k.to_string(), c.to_string())).collect()
    }

    #[test]
    fn test_archive_extracts_nested_files() {
        let set = files(&[("main.py", "print(1+1)\n"), ("pkg/util.py", "X = 1\n")]);
        let bytes = build_archive(&set).unwrap();

        let dir = tempfile::tempdir().unwrap();
        extract_archive(&bytes, dir.path()).unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("main.py")).unwrap(),
            "print(1+1)\n"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("pkg/util.py")).unwrap(),
            "X = 1\n"
        );
    }

    #[test]
    fn test_archive_is_deterministic() {
        let set = files(&[("a.py", "1"), ("b/c.txt", "2")]);
        assert_eq!(build_archive(&set).unwrap(), build_archive(&set).unwrap());
    }

    #[test]
    fn test_rejects_escaping_names() {
        assert!(build_archive(&files(&[("../evil.py", "")])).is_err());
        assert!(build_archive(&files(&[("/etc/passwd", "")])).is_err());
    }
}
