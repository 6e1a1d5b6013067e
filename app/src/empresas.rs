use anyhow::{Context, Result};
use chrono::Local;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use crate::checkpoint::{self, AtomicCsv};
use crate::models;
use crate::schema;
use crate::ui;
use crate::utils;

pub struct EmpresasConfig {
    pub input: String,
    pub input_dir: String,
    pub output: String,
    pub auto_yes: bool,
}

/// Colunas da base que seguem adiante quando existem, nesta ordem.
const PASSTHROUGH: [&str; 8] = [
    "nome",
    "situacao",
    "endereco",
    "cnae_fiscal_principal",
    "cnaes_secundarios",
    "match_por",
    "municipio",
    "uf",
];
const CONTATO: [&str; 3] = ["email", "telefone_1", "telefone_2"];

struct DadosEmpresa {
    razao_social: String,
    qualificacao_responsavel: String,
    capital_social_str: String,
    porte: String,
}

/// "1234,56" e "1234.56" viram "1234.56"; o que não parsear vira vazio.
fn parse_capital_social(valor: &str) -> String {
    let bruto = valor.trim();
    if bruto.is_empty() {
        return String::new();
    }
    match bruto.replace(',', ".").parse::<f64>() {
        Ok(n) if n.is_finite() => format!("{:.2}", n),
        _ => String::new(),
    }
}

pub fn run(config: &EmpresasConfig) -> Result<()> {
    ui::print_header("🏢 Enriquecimento com os dados de empresas");
    ui::print_info(&format!(
        "Hora de início: {}",
        Local::now().format("%Y-%m-%d %H:%M:%S")
    ));
    ui::print_info(&format!("Base filtrada: {}", config.input));
    ui::print_info(&format!("Diretório dos dados abertos: {}", config.input_dir));

    let input_path = Path::new(&config.input);
    let header = checkpoint::validate_columns(input_path, &["cnpj"])?;
    let idx_cnpj = header.iter().position(|h| h == "cnpj").unwrap_or(0);
    let passthrough: Vec<(usize, &str)> = PASSTHROUGH
        .iter()
        .filter_map(|nome| header.iter().position(|h| h == nome).map(|i| (i, *nome)))
        .collect();
    let contato: Vec<(usize, &str)> = CONTATO
        .iter()
        .filter_map(|nome| header.iter().position(|h| h == nome).map(|i| (i, *nome)))
        .collect();

    ui::print_step(1, 3, "Lendo a base filtrada");
    let mut registros: Vec<csv::StringRecord> = Vec::new();
    let mut malformadas_base = 0u64;
    {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(input_path)?;
        for result in rdr.records() {
            match result {
                Ok(record) => registros.push(record),
                Err(_) => malformadas_base += 1,
            }
        }
    }
    ui::print_success(&format!("{} linha(s) na base", registros.len()));

    let necessarios: HashSet<String> = registros
        .iter()
        .map(|r| utils::cnpj_basico(r.get(idx_cnpj).unwrap_or("")))
        .collect();

    let quals_files = utils::get_files_by_pattern(&config.input_dir, "*QUALSCSV*")?;
    let quals_path = quals_files.first().ok_or_else(|| {
        anyhow::anyhow!(
            "Tabela de qualificações (*QUALSCSV*) não encontrada em {}",
            config.input_dir
        )
    })?;
    let quals = schema::load_codigo_map(quals_path)
        .with_context(|| format!("Falha ao ler {:?}", quals_path))?;
    ui::print_verbose(&format!("{} qualificações carregadas", quals.len()));

    let emp_files = utils::get_files_by_pattern(&config.input_dir, "*.EMPRECSV*")?;
    if emp_files.is_empty() {
        anyhow::bail!(
            "Nenhum arquivo *.EMPRECSV* encontrado em {}",
            config.input_dir
        );
    }

    ui::print_step(2, 3, "Varrendo os arquivos de empresas");
    let mut encontradas: HashMap<String, DadosEmpresa> = HashMap::new();
    let mut lidas_empresas = 0u64;
    let mut malformadas_emp = 0u64;
    for (idx, emp_path) in emp_files.iter().enumerate() {
        let nome_arquivo = emp_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("arquivo");
        ui::print_verbose(&format!(
            "Arquivo {}/{}: {}",
            idx + 1,
            emp_files.len(),
            nome_arquivo
        ));

        let tamanho = fs::metadata(emp_path)?.len();
        let pb = ProgressBar::new((tamanho / 200).max(1));
        pb.set_style(
            ProgressStyle::default_bar()
                .template("  [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) | {msg}")?
                .progress_chars("#>-"),
        );

        let mut rdr = utils::latin1_csv_reader(emp_path)?;
        let mut lidas_arquivo = 0u64;
        for result in rdr.records() {
            lidas_empresas += 1;
            lidas_arquivo += 1;
            if lidas_arquivo % 10_000 == 0 {
                pb.set_position(lidas_arquivo);
                pb.set_message(format!("{} casadas", encontradas.len()));
            }
            let record = match result {
                Ok(r) => r,
                Err(_) => {
                    malformadas_emp += 1;
                    continue;
                }
            };
            let Some(emp) = schema::decode_empresa(&record) else {
                malformadas_emp += 1;
                continue;
            };
            if !necessarios.contains(&emp.cnpj_basico) {
                continue;
            }
            // primeira ocorrência vence
            encontradas
                .entry(emp.cnpj_basico.clone())
                .or_insert_with(|| DadosEmpresa {
                    razao_social: emp.razao_social.clone(),
                    qualificacao_responsavel: emp.qualificacao_responsavel.clone(),
                    capital_social_str: emp.capital_social_str.clone(),
                    porte: emp.porte_empresa.clone(),
                });
        }
        pb.set_position(lidas_arquivo);
        pb.finish_with_message(format!("{} casadas", encontradas.len()));
    }

    let out_path = Path::new(&config.output);
    if !checkpoint::confirm_overwrite(out_path, config.auto_yes)? {
        ui::print_info("Operação cancelada pelo usuário.");
        return Ok(());
    }

    ui::print_step(3, 3, "Gravando a base enriquecida");
    let mut atomic = AtomicCsv::create(out_path)?;
    let mut header_saida: Vec<&str> = vec!["razao_social", "cnpj"];
    header_saida.extend(passthrough.iter().map(|(_, nome)| *nome));
    header_saida.extend([
        "porte_empresa",
        "porte_empresa_txt",
        "capital_social",
        "qualificacao_responsavel",
        "qualificacao_responsavel_txt",
    ]);
    header_saida.extend(contato.iter().map(|(_, nome)| *nome));
    atomic.writer().write_record(&header_saida)?;

    let mut linhas: Vec<Vec<String>> = Vec::with_capacity(registros.len());
    let mut vistos: HashSet<String> = HashSet::new();
    let mut com_correspondencia = 0u64;
    let mut sem_correspondencia = 0u64;
    let mut quals_desconhecidas = 0u64;

    for record in &registros {
        let cnpj = record.get(idx_cnpj).unwrap_or("").trim().to_string();
        if !vistos.insert(cnpj.clone()) {
            continue;
        }
        let basico = utils::cnpj_basico(&cnpj);
        let dados = encontradas.get(&basico);
        match dados {
            Some(_) => com_correspondencia += 1,
            None => sem_correspondencia += 1,
        }

        let razao = dados.map(|d| d.razao_social.as_str()).unwrap_or("");
        let porte = dados.map(|d| d.porte.as_str()).unwrap_or("");
        let capital = dados
            .map(|d| parse_capital_social(&d.capital_social_str))
            .unwrap_or_default();
        let qual_cod = dados
            .map(|d| d.qualificacao_responsavel.as_str())
            .unwrap_or("");
        let qual_txt = if qual_cod.trim().is_empty() {
            String::new()
        } else {
            match schema::decode_codigo(&quals, qual_cod) {
                Some(txt) => txt.to_string(),
                None => {
                    quals_desconhecidas += 1;
                    qual_cod.trim().to_string()
                }
            }
        };

        let mut linha: Vec<String> = vec![razao.to_string(), cnpj];
        for (idx, _) in &passthrough {
            linha.push(record.get(*idx).unwrap_or("").to_string());
        }
        linha.push(porte.to_string());
        linha.push(models::porte_empresa_txt(porte).to_string());
        linha.push(capital);
        linha.push(qual_cod.to_string());
        linha.push(qual_txt);
        for (idx, _) in &contato {
            linha.push(record.get(*idx).unwrap_or("").to_string());
        }
        linhas.push(linha);
    }

    linhas.sort_by(|a, b| a[0].cmp(&b[0]).then_with(|| a[1].cmp(&b[1])));
    for linha in &linhas {
        atomic.writer().write_record(linha)?;
    }
    atomic.promote()?;

    if quals_desconhecidas > 0 {
        ui::print_warning(&format!(
            "{} linha(s) com código de qualificação fora da tabela; o código cru foi mantido.",
            quals_desconhecidas
        ));
    }

    ui::print_separator();
    ui::print_success("Enriquecimento concluído!");
    ui::print_info(&format!("Arquivo criado: {}", config.output));
    ui::print_statistics(&[
        ("Linhas da base", registros.len() as u64),
        ("Linhas de empresas varridas", lidas_empresas),
        ("Com correspondência", com_correspondencia),
        ("Sem correspondência", sem_correspondencia),
        ("Linhas malformadas na base", malformadas_base),
        ("Linhas malformadas em empresas", malformadas_emp),
    ]);

    Ok(())
}
