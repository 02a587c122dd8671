use std::{
    fs, io,
    path::{Path, PathBuf},
};

/// Operaciones de sistema de archivos que necesita el driver: limpieza previa
/// de la salida y borrado de datos intermedios.
pub trait FileSystem: Send + Sync {
    fn mkdirs(&self, path: &Path) -> io::Result<()>;

    /// Devuelve `false` si no había nada que borrar.
    fn delete(&self, path: &Path, recursive: bool) -> io::Result<bool>;

    fn exists(&self, path: &Path) -> bool;

    fn is_file(&self, path: &Path) -> bool;

    /// Rutas que matchean un patrón glob, ordenadas.
    fn list_matching(&self, pattern: &str) -> io::Result<Vec<PathBuf>>;
}

/// Patrón glob `<dir>/<suffix>` con los metacaracteres de `dir` escapados,
/// para que `[`, `*` o `?` en la ruta no se lean como comodines.
pub fn pattern_in(dir: &Path, suffix: &str) -> String {
    format!("{}/{}", glob::Pattern::escape(&dir.to_string_lossy()), suffix)
}

/// Sistema de archivos local (el mismo que ven master y cliente en docker).
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileSystem;

impl FileSystem for LocalFileSystem {
    fn mkdirs(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn delete(&self, path: &Path, recursive: bool) -> io::Result<bool> {
        let meta = match fs::symlink_metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };

        if meta.is_dir() {
            if recursive {
                fs::remove_dir_all(path)?;
            } else {
                fs::remove_dir(path)?;
            }
        } else {
            fs::remove_file(path)?;
        }
        Ok(true)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn list_matching(&self, pattern: &str) -> io::Result<Vec<PathBuf>> {
        let entries = glob::glob(pattern).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("patrón glob inválido '{pattern}': {e}"),
            )
        })?;

        let mut out = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
            out.push(path);
        }
        out.sort();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("fs_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    #[test]
    fn list_matching_devuelve_rutas_ordenadas() {
        let tmp = temp_dir("glob");
        fs::write(tmp.join("part-m-00001"), "").unwrap();
        fs::write(tmp.join("part-m-00000"), "").unwrap();
        fs::write(tmp.join("sideeffect-m-00000"), "").unwrap();

        let fs = LocalFileSystem;
        let found = fs
            .list_matching(&format!("{}/part*", tmp.display()))
            .unwrap();
        assert_eq!(found, vec![tmp.join("part-m-00000"), tmp.join("part-m-00001")]);
    }

    #[test]
    fn pattern_in_escapa_corchetes_del_directorio() {
        let tmp = temp_dir("run[1]");
        fs::write(tmp.join("graph-m-00000.kv"), "").unwrap();
        fs::write(tmp.join("part-m-00000.kv"), "").unwrap();

        let fs = LocalFileSystem;
        let found = fs.list_matching(&pattern_in(&tmp, "graph*")).unwrap();
        assert_eq!(found, vec![tmp.join("graph-m-00000.kv")]);
        assert!(fs.is_file(&found[0]));
        assert!(!fs.is_file(&tmp));
    }

    #[test]
    fn delete_recursivo_y_ruta_inexistente() {
        let tmp = temp_dir("delete");
        let fs = LocalFileSystem;
        let nested = tmp.join("a/b");
        fs.mkdirs(&nested).unwrap();
        std::fs::write(nested.join("x"), "1").unwrap();

        assert!(fs.delete(&tmp.join("a"), true).unwrap());
        assert!(!fs.exists(&tmp.join("a")));
        assert!(!fs.delete(&tmp.join("a"), true).unwrap());
    }

    #[test]
    fn delete_no_recursivo_falla_con_directorio_lleno() {
        let tmp = temp_dir("delete_nr");
        let fs = LocalFileSystem;
        std::fs::write(tmp.join("x"), "1").unwrap();
        assert!(fs.delete(&tmp, false).is_err());
    }
}
