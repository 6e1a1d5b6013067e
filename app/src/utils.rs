use anyhow::{Context, Result};
use encoding_rs_io::DecodeReaderBytesBuilder;
use std::fs;
use std::path::{Path, PathBuf};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Falha ao criar diretório: {:?}", parent))?;
        }
    }
    Ok(())
}

pub fn get_files_by_pattern(dir: &str, pattern: &str) -> Result<Vec<PathBuf>> {
    let full_pattern = format!("{}/{}", dir.trim_end_matches('/'), pattern);
    let mut files: Vec<PathBuf> = glob::glob(&full_pattern)?
        .filter_map(|entry| entry.ok())
        .collect();
    files.sort();
    Ok(files)
}

pub fn create_latin1_reader(file_path: &Path) -> Result<Box<dyn std::io::Read>> {
    let file = fs::File::open(file_path)
        .with_context(|| format!("Falha ao abrir arquivo: {:?}", file_path))?;

    let reader = DecodeReaderBytesBuilder::new()
        .encoding(Some(encoding_rs::WINDOWS_1252)) // Latin1 equivalente
        .build(file);

    Ok(Box::new(reader))
}

/// Reader CSV para os arquivos brutos da Receita: latin1, `;`, sem cabeçalho.
pub fn latin1_csv_reader(file_path: &Path) -> Result<csv::Reader<Box<dyn std::io::Read>>> {
    let reader = create_latin1_reader(file_path)?;
    Ok(csv::ReaderBuilder::new()
        .delimiter(b';')
        .has_headers(false)
        .flexible(true)
        .from_reader(reader))
}

/// Normaliza texto para busca: remove acentos, colapsa espaços, UPPER.
pub fn normalize_lookup(texto: &str) -> String {
    let sem_acentos: String = texto
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .collect();
    sem_acentos
        .to_uppercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

const NA_TOKENS: [&str; 5] = ["NA", "N/A", "NAN", "NULL", "NONE"];

/// Limpa uma célula vinda dos CSVs brutos: trim e sentinelas tipo NA viram vazio.
pub fn clean_cell(raw: &str) -> String {
    let trimmed = raw.trim();
    let upper = trimmed.to_ascii_uppercase();
    if NA_TOKENS.contains(&upper.as_str()) {
        String::new()
    } else {
        trimmed.to_string()
    }
}

pub fn only_digits(texto: &str) -> String {
    texto.chars().filter(|c| c.is_ascii_digit()).collect()
}

pub fn zfill(texto: &str, width: usize) -> String {
    format!("{:0>1$}", texto, width)
}

pub fn format_cnpj(cnpj: &str) -> String {
    let d = zfill(&only_digits(cnpj), 14);
    format!(
        "{}.{}.{}/{}-{}",
        &d[..2],
        &d[2..5],
        &d[5..8],
        &d[8..12],
        &d[12..14]
    )
}

/// Primeiro bloco do CNPJ (8 dígitos), com zeros à esquerda garantidos.
pub fn cnpj_basico(cnpj: &str) -> String {
    zfill(cnpj.trim(), 14).chars().take(8).collect()
}

// ---------- dimensionamento de chunks ----------

const GIB: u64 = 1024 * 1024 * 1024;
pub const CHUNKSIZE_MIN: usize = 10_000;
pub const CHUNKSIZE_MAX: usize = 300_000;

/// Estima bytes por linha decodificada amostrando o início de um arquivo bruto.
pub fn estimate_bytes_per_row(file_path: &Path, sample_rows: usize) -> Result<f64> {
    let mut rdr = latin1_csv_reader(file_path)?;
    let mut total: u64 = 0;
    let mut rows: u64 = 0;

    for result in rdr.records().take(sample_rows) {
        let record = match result {
            Ok(r) => r,
            Err(_) => continue,
        };
        let field_bytes: usize = record.iter().map(|f| f.len()).sum();
        // cada campo vira uma String própria depois de decodificado
        total += (field_bytes + record.len() * 24) as u64;
        rows += 1;
    }

    if rows == 0 {
        anyhow::bail!("Arquivo sem linhas para amostrar: {:?}", file_path);
    }
    Ok(total as f64 / rows as f64)
}

fn parse_meminfo(conteudo: &str) -> Option<u64> {
    let mut memfree = 0u64;
    let mut buffers = 0u64;
    let mut cached = 0u64;

    for line in conteudo.lines() {
        let mut parts = line.split_whitespace();
        let label = parts.next().unwrap_or("");
        let value: u64 = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0);
        match label {
            "MemAvailable:" => return Some(value * 1024),
            "MemFree:" => memfree = value * 1024,
            "Buffers:" => buffers = value * 1024,
            "Cached:" => cached = value * 1024,
            _ => {}
        }
    }

    let soma = memfree + buffers + cached;
    if soma > 0 {
        Some(soma)
    } else {
        None
    }
}

pub fn available_ram_bytes() -> u64 {
    fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|texto| parse_meminfo(&texto))
        .unwrap_or(GIB)
}

/// Sugere um chunksize que caiba em 35% da RAM disponível, com teto de 400 MB
/// por chunk e limites de segurança em linhas.
pub fn suggest_chunksize(bytes_per_row: f64, available: u64) -> (usize, u64) {
    let budget = std::cmp::min((available as f64 * 0.35) as u64, 400 * 1024 * 1024);
    let bruto = (budget as f64 / bytes_per_row.max(1.0)) as usize;
    let chunksize = bruto.clamp(CHUNKSIZE_MIN, CHUNKSIZE_MAX);
    (chunksize, budget)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_lookup_remove_acentos_e_colapsa_espacos() {
        assert_eq!(normalize_lookup("São  Carlos"), "SAO CARLOS");
        assert_eq!(normalize_lookup("  ibaté "), "IBATE");
        assert_eq!(normalize_lookup("SÃO JOSÉ DO RIO PRETO"), "SAO JOSE DO RIO PRETO");
    }

    #[test]
    fn clean_cell_normaliza_sentinelas() {
        assert_eq!(clean_cell("  RUA X  "), "RUA X");
        assert_eq!(clean_cell("NA"), "");
        assert_eq!(clean_cell("n/a"), "");
        assert_eq!(clean_cell("null"), "");
        assert_eq!(clean_cell("NONE"), "");
        assert_eq!(clean_cell("NATAL"), "NATAL");
        assert_eq!(clean_cell("   "), "");
    }

    #[test]
    fn zfill_preenche_sem_truncar() {
        assert_eq!(zfill("123", 8), "00000123");
        assert_eq!(zfill("123456789", 8), "123456789");
    }

    #[test]
    fn format_cnpj_pontua_14_digitos() {
        assert_eq!(format_cnpj("12345678000190"), "12.345.678/0001-90");
        assert_eq!(format_cnpj("123.45678/0001-90"), "12.345.678/0001-90");
        assert_eq!(format_cnpj("190"), "00.000.000/0001-90");
    }

    #[test]
    fn cnpj_basico_completa_zeros() {
        assert_eq!(cnpj_basico("12345678000190"), "12345678");
        assert_eq!(cnpj_basico(" 345678000190 "), "00345678");
    }

    #[test]
    fn suggest_chunksize_respeita_limites() {
        // memória minúscula: bate no piso
        let (chunk, _) = suggest_chunksize(1000.0, 1024 * 1024);
        assert_eq!(chunk, CHUNKSIZE_MIN);

        // memória enorme: bate no teto de linhas
        let (chunk, budget) = suggest_chunksize(100.0, 64 * 1024 * 1024 * 1024);
        assert_eq!(chunk, CHUNKSIZE_MAX);
        // e o orçamento nunca passa de 400 MB
        assert_eq!(budget, 400 * 1024 * 1024);

        // caso intermediário: budget / bytes_por_linha
        let (chunk, budget) = suggest_chunksize(2048.0, 200 * 1024 * 1024);
        assert_eq!(budget, (200.0 * 1024.0 * 1024.0 * 0.35) as u64);
        assert_eq!(chunk, (budget as f64 / 2048.0) as usize);
    }

    #[test]
    fn parse_meminfo_prefere_memavailable() {
        let texto = "MemTotal:       16000000 kB\nMemFree:        1000000 kB\nMemAvailable:   8000000 kB\nBuffers:        200000 kB\n";
        assert_eq!(parse_meminfo(texto), Some(8_000_000 * 1024));

        let sem_available = "MemFree:        1000000 kB\nBuffers:        200000 kB\nCached:         300000 kB\n";
        assert_eq!(parse_meminfo(sem_available), Some(1_500_000 * 1024));

        assert_eq!(parse_meminfo("lixo"), None);
    }
}
