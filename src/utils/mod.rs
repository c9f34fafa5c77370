use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Ensure directory exists
pub fn ensure_dir<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    if !path.exists() {
        std::fs::create_dir_all(path).with_context(|| format!("Failed to create directory: {:?}", path))?;
    }
    Ok(())
}

/// Open an output file, creating parent directories; `.gz` paths are compressed
pub fn create_output<P: AsRef<Path>>(path: P) -> Result<Box<dyn Write>> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        ensure_dir(parent)?;
    }
    let file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
    let gzipped = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("gz"));

    Ok(if gzipped {
        Box::new(GzEncoder::new(BufWriter::new(file), Compression::default()))
    } else {
        Box::new(BufWriter::new(file))
    })
}

/// Format duration as human-readable string
pub fn format_duration(secs: f64) -> String {
    if secs < 60.0 {
        format!("{:.1}s", secs)
    } else if secs < 3600.0 {
        format!("{:.1}m", secs / 60.0)
    } else {
        format!("{:.1}h", secs / 3600.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use tempfile::TempDir;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(30.0), "30.0s");
        assert_eq!(format_duration(90.0), "1.5m");
        assert_eq!(format_duration(5400.0), "1.5h");
    }

    #[test]
    fn test_create_output_nested_and_gzipped() {
        let dir = TempDir::new().unwrap();
        let plain = dir.path().join("a").join("b").join("out.csv");
        {
            let mut w = create_output(&plain).unwrap();
            w.write_all(b"cell,label\n").unwrap();
        }
        assert_eq!(std::fs::read_to_string(&plain).unwrap(), "cell,label\n");

        let gz = dir.path().join("out.csv.gz");
        {
            let mut w = create_output(&gz).unwrap();
            w.write_all(b"x\n").unwrap();
        }
        let mut text = String::new();
        GzDecoder::new(File::open(&gz).unwrap()).read_to_string(&mut text).unwrap();
        assert_eq!(text, "x\n");
    }
}
