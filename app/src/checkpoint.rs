use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::ui;
use crate::utils;

/// Valida um checkpoint de estágio: o arquivo precisa existir e o cabeçalho
/// precisa conter todas as colunas exigidas pela configuração atual.
/// Retorna o cabeçalho completo para os estágios que repassam colunas.
pub fn validate_columns(path: &Path, required: &[&str]) -> Result<Vec<String>> {
    if !path.exists() {
        anyhow::bail!("Arquivo de entrada não encontrado: {:?}", path);
    }
    let mut rdr = csv::Reader::from_path(path)
        .with_context(|| format!("Falha ao abrir arquivo: {:?}", path))?;
    let header: Vec<String> = rdr
        .headers()
        .with_context(|| format!("Falha ao ler cabeçalho de {:?}", path))?
        .iter()
        .map(|h| h.to_string())
        .collect();

    let missing: Vec<&str> = required
        .iter()
        .filter(|col| !header.iter().any(|h| h.as_str() == **col))
        .copied()
        .collect();
    if !missing.is_empty() {
        anyhow::bail!(
            "O arquivo {:?} precisa conter as colunas: {}. Ausentes: {}",
            path,
            required.join(", "),
            missing.join(", ")
        );
    }
    Ok(header)
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}

/// Escritor CSV que grava em `<saida>.tmp` e só renomeia para o destino na
/// promoção. Uma interrupção nunca deixa uma saída declarada pela metade.
pub struct AtomicCsv {
    tmp_path: PathBuf,
    final_path: PathBuf,
    writer: csv::Writer<fs::File>,
}

impl AtomicCsv {
    pub fn create(path: &Path) -> Result<Self> {
        utils::ensure_parent_dir(path)?;
        let tmp_path = tmp_path_for(path);
        let file = fs::File::create(&tmp_path)
            .with_context(|| format!("Falha ao criar arquivo temporário: {:?}", tmp_path))?;
        Ok(AtomicCsv {
            tmp_path,
            final_path: path.to_path_buf(),
            writer: csv::Writer::from_writer(file),
        })
    }

    pub fn writer(&mut self) -> &mut csv::Writer<fs::File> {
        &mut self.writer
    }

    pub fn promote(self) -> Result<()> {
        let AtomicCsv {
            tmp_path,
            final_path,
            mut writer,
        } = self;
        writer.flush()?;
        drop(writer);
        fs::rename(&tmp_path, &final_path)
            .with_context(|| format!("Falha ao promover {:?} para {:?}", tmp_path, final_path))?;
        Ok(())
    }
}

/// Grava um documento JSON com a mesma disciplina de temporário + rename.
pub fn write_json_atomic<T: Serialize>(path: &Path, doc: &T) -> Result<()> {
    utils::ensure_parent_dir(path)?;
    let tmp_path = tmp_path_for(path);
    let file = fs::File::create(&tmp_path)
        .with_context(|| format!("Falha ao criar arquivo temporário: {:?}", tmp_path))?;
    let mut buffered = std::io::BufWriter::new(file);
    serde_json::to_writer_pretty(&mut buffered, doc)
        .with_context(|| format!("Falha ao serializar JSON para {:?}", tmp_path))?;
    buffered.write_all(b"\n")?;
    buffered.flush()?;
    drop(buffered);
    fs::rename(&tmp_path, path)
        .with_context(|| format!("Falha ao promover {:?} para {:?}", tmp_path, path))?;
    Ok(())
}

/// Saídas existentes só são sobrescritas com confirmação (ou com --yes).
pub fn confirm_overwrite(path: &Path, auto_yes: bool) -> Result<bool> {
    if !path.exists() {
        return Ok(true);
    }
    ui::print_warning(&format!("O arquivo {:?} já existe e será sobrescrito.", path));
    if auto_yes {
        return Ok(true);
    }
    Ok(ui::ask_confirmation_no("Deseja sobrescrever?")?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_columns_aceita_e_nomeia_ausentes() {
        let dir = tempfile::tempdir().unwrap();
        let caminho = dir.path().join("base.csv");
        fs::write(&caminho, "nome,cnpj,endereco\na,1,r\n").unwrap();

        let header = validate_columns(&caminho, &["nome", "cnpj"]).unwrap();
        assert_eq!(header, vec!["nome", "cnpj", "endereco"]);

        let err = validate_columns(&caminho, &["nome", "municipio", "uf"]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("municipio"));
        assert!(msg.contains("uf"));
        assert!(!msg.contains("Ausentes: nome"));
    }

    #[test]
    fn validate_columns_exige_arquivo() {
        let dir = tempfile::tempdir().unwrap();
        let err = validate_columns(&dir.path().join("nao_existe.csv"), &["cnpj"]).unwrap_err();
        assert!(err.to_string().contains("não encontrado"));
    }

    #[test]
    fn atomic_csv_so_aparece_depois_da_promocao() {
        let dir = tempfile::tempdir().unwrap();
        let destino = dir.path().join("saida.csv");

        let mut atomic = AtomicCsv::create(&destino).unwrap();
        atomic.writer().write_record(["a", "b"]).unwrap();
        assert!(!destino.exists());

        atomic.promote().unwrap();
        assert!(destino.exists());
        let conteudo = fs::read_to_string(&destino).unwrap();
        assert_eq!(conteudo, "a,b\n");
    }

    #[test]
    fn json_atomic_grava_e_promove() {
        let dir = tempfile::tempdir().unwrap();
        let destino = dir.path().join("doc.json");
        write_json_atomic(&destino, &serde_json::json!({"ok": true})).unwrap();
        let texto = fs::read_to_string(&destino).unwrap();
        assert!(texto.contains("\"ok\": true"));
        assert!(!dir.path().join("doc.json.tmp").exists());
    }
}
