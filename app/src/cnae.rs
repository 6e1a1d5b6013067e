use anyhow::Result;
use chrono::Local;
use indicatif::{ProgressBar, ProgressStyle};
use regex::Regex;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::checkpoint::{self, AtomicCsv};
use crate::ui;
use crate::utils;

pub struct CnaeConfig {
    pub input: String,
    pub output: String,
    pub cnaes: Vec<String>,
    pub chunksize: usize,
    pub auto_yes: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchPor {
    Principal,
    Secundario,
    Ambos,
}

impl MatchPor {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchPor::Principal => "principal",
            MatchPor::Secundario => "secundario",
            MatchPor::Ambos => "ambos",
        }
    }
}

/// Aceita CNAEs em qualquer grafia ("6201-5/01", "6201501") e mais de um
/// código na mesma string, separado por vírgula ou espaço. O que não reduzir
/// a exatamente 7 dígitos é descartado com aviso; sem nenhum código válido
/// no fim é erro. Remove repetidos mantendo a ordem.
pub fn normalize_cnae_list(entradas: &[String]) -> Result<Vec<String>> {
    let mut vistos = HashSet::new();
    let mut lista = Vec::new();
    for entrada in entradas {
        for pedaco in entrada.split(|c: char| c == ',' || c.is_whitespace()) {
            if pedaco.is_empty() {
                continue;
            }
            let digitos = utils::only_digits(pedaco);
            if digitos.len() != 7 {
                ui::print_warning(&format!(
                    "CNAE ignorado: {:?} (esperado código de 7 dígitos, ex.: 6201-5/01)",
                    pedaco
                ));
                continue;
            }
            if vistos.insert(digitos.clone()) {
                lista.push(digitos);
            }
        }
    }
    if lista.is_empty() {
        anyhow::bail!("Nenhum CNAE válido (7 dígitos) informado.");
    }
    Ok(lista)
}

/// O principal compara o código inteiro; dos secundários vale qualquer grupo
/// de 7 dígitos achado no texto da célula.
pub fn classify(
    principal: &str,
    secundarios: &str,
    alvo: &HashSet<String>,
    re_sete: &Regex,
) -> Option<MatchPor> {
    let bate_principal = alvo.contains(principal.trim());
    let bate_secundario = re_sete
        .find_iter(secundarios)
        .any(|m| alvo.contains(m.as_str()));
    match (bate_principal, bate_secundario) {
        (true, true) => Some(MatchPor::Ambos),
        (true, false) => Some(MatchPor::Principal),
        (false, true) => Some(MatchPor::Secundario),
        (false, false) => None,
    }
}

pub fn run(config: &CnaeConfig) -> Result<()> {
    ui::print_header("🏷️ Refiltro da base por CNAE");
    ui::print_info(&format!(
        "Hora de início: {}",
        Local::now().format("%Y-%m-%d %H:%M:%S")
    ));
    ui::print_info(&format!("Entrada: {}", config.input));

    if config.cnaes.is_empty() {
        anyhow::bail!("Informe ao menos um CNAE em --cnae");
    }
    let lista = normalize_cnae_list(&config.cnaes)?;
    ui::print_info(&format!("CNAEs alvo: {}", lista.join(", ")));
    let alvo: HashSet<String> = lista.into_iter().collect();
    let re_sete = Regex::new(r"\d{7}")?;

    let input_path = Path::new(&config.input);
    let header = checkpoint::validate_columns(
        input_path,
        &[
            "nome",
            "cnpj",
            "endereco",
            "cnae_fiscal_principal",
            "cnaes_secundarios",
            "municipio",
            "uf",
        ],
    )?;

    let idx_principal = header.iter().position(|h| h == "cnae_fiscal_principal").unwrap_or(0);
    let idx_secundarios = header.iter().position(|h| h == "cnaes_secundarios").unwrap_or(0);

    // match_por entra logo após cnaes_secundarios; se a coluna já existir
    // (refiltro de um refiltro), é sobrescrita no lugar.
    let mut header_saida = header.clone();
    let (idx_match, inserir_match) = match header.iter().position(|h| h == "match_por") {
        Some(idx) => (idx, false),
        None => {
            let idx = idx_secundarios + 1;
            header_saida.insert(idx, "match_por".to_string());
            (idx, true)
        }
    };
    let idx_nome = header_saida.iter().position(|h| h == "nome").unwrap_or(0);
    let idx_cnpj = header_saida.iter().position(|h| h == "cnpj").unwrap_or(0);

    let out_path = Path::new(&config.output);
    if !checkpoint::confirm_overwrite(out_path, config.auto_yes)? {
        ui::print_info("Operação cancelada pelo usuário.");
        return Ok(());
    }

    let mut atomic = AtomicCsv::create(out_path)?;
    atomic.writer().write_record(&header_saida)?;

    let tamanho = fs::metadata(input_path)?.len();
    let pb = ProgressBar::new((tamanho / 200).max(1));
    pb.set_style(
        ProgressStyle::default_bar()
            .template("  [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) | {msg}")?
            .progress_chars("#>-"),
    );

    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(input_path)?;

    let mut buffer: Vec<Vec<String>> = Vec::new();
    let mut lidas = 0u64;
    let mut malformadas = 0u64;
    let mut por_principal = 0u64;
    let mut por_secundario = 0u64;
    let mut por_ambos = 0u64;
    let mut no_chunk = 0usize;

    let flush = |buffer: &mut Vec<Vec<String>>, atomic: &mut AtomicCsv| -> Result<()> {
        buffer.sort_by(|a, b| {
            a[idx_nome]
                .cmp(&b[idx_nome])
                .then_with(|| a[idx_cnpj].cmp(&b[idx_cnpj]))
        });
        for linha in buffer.drain(..) {
            atomic.writer().write_record(&linha)?;
        }
        Ok(())
    };

    for result in rdr.records() {
        lidas += 1;
        no_chunk += 1;
        if lidas % 10_000 == 0 {
            pb.set_position(lidas);
            pb.set_message(format!("{} mantidas", por_principal + por_secundario + por_ambos));
        }
        if no_chunk >= config.chunksize {
            flush(&mut buffer, &mut atomic)?;
            no_chunk = 0;
        }

        let record = match result {
            Ok(r) => r,
            Err(_) => {
                malformadas += 1;
                continue;
            }
        };
        let principal = record.get(idx_principal).unwrap_or("");
        let secundarios = record.get(idx_secundarios).unwrap_or("");
        let Some(tag) = classify(principal, secundarios, &alvo, &re_sete) else {
            continue;
        };
        match tag {
            MatchPor::Principal => por_principal += 1,
            MatchPor::Secundario => por_secundario += 1,
            MatchPor::Ambos => por_ambos += 1,
        }

        let mut linha: Vec<String> = record.iter().map(|c| c.to_string()).collect();
        if inserir_match {
            linha.insert(idx_match, tag.as_str().to_string());
        } else if let Some(campo) = linha.get_mut(idx_match) {
            *campo = tag.as_str().to_string();
        }
        buffer.push(linha);
    }
    flush(&mut buffer, &mut atomic)?;
    atomic.promote()?;

    let mantidas = por_principal + por_secundario + por_ambos;
    pb.set_position(lidas);
    pb.finish_with_message(format!("{} mantidas", mantidas));

    ui::print_separator();
    ui::print_success("Refiltro concluído!");
    ui::print_info(&format!("Arquivo criado: {}", config.output));
    ui::print_statistics(&[
        ("Linhas lidas", lidas),
        ("Linhas mantidas", mantidas),
        ("Match pelo CNAE principal", por_principal),
        ("Match por CNAE secundário", por_secundario),
        ("Match por ambos", por_ambos),
        ("Linhas malformadas ignoradas", malformadas),
    ]);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn normalize_aceita_grafias_e_deduplica() {
        let lista = normalize_cnae_list(&[
            "6201-5/01".to_string(),
            "6201501".to_string(),
            "4721-1/02".to_string(),
        ])
        .unwrap();
        assert_eq!(lista, vec!["6201501", "4721102"]);
    }

    #[test]
    fn normalize_separa_codigos_na_mesma_string() {
        let lista = normalize_cnae_list(&["6201501,6311900".to_string()]).unwrap();
        assert_eq!(lista, vec!["6201501", "6311900"]);

        let lista = normalize_cnae_list(&["6201501 6311900,  4721-1/02".to_string()]).unwrap();
        assert_eq!(lista, vec!["6201501", "6311900", "4721102"]);
    }

    #[test]
    fn normalize_descarta_invalidos_e_so_falha_sem_nenhum() {
        let lista =
            normalize_cnae_list(&["6201501".to_string(), "999".to_string()]).unwrap();
        assert_eq!(lista, vec!["6201501"]);

        let err = normalize_cnae_list(&["62015".to_string()]).unwrap_err();
        assert!(err.to_string().contains("Nenhum CNAE válido"));
        let err = normalize_cnae_list(&[]).unwrap_err();
        assert!(err.to_string().contains("Nenhum CNAE válido"));
    }

    #[test]
    fn classify_cobre_os_quatro_casos() {
        let re = Regex::new(r"\d{7}").unwrap();
        let alvo: HashSet<String> = ["6201501".to_string()].into_iter().collect();

        assert_eq!(classify("6201501", "", &alvo, &re), Some(MatchPor::Principal));
        assert_eq!(
            classify("4721102", "4721-1/02, 6201501 e 999", &alvo, &re),
            Some(MatchPor::Secundario)
        );
        assert_eq!(
            classify(" 6201501 ", "6201501", &alvo, &re),
            Some(MatchPor::Ambos)
        );
        assert_eq!(classify("4721102", "999", &alvo, &re), None);
    }

    #[test]
    fn run_insere_match_por_e_preserva_colunas() {
        let dir = tempfile::tempdir().unwrap();
        let entrada = dir.path().join("base.csv");
        fs::write(
            &entrada,
            "nome,cnpj,situacao,endereco,cnae_fiscal_principal,cnaes_secundarios,municipio,uf,email,telefone_1,telefone_2\n\
             ZULU,22222222000190,Ativa,RUA B,4721102,\"6201501,999\",Ibaté,SP,z@z.com,,\n\
             ALFA,11111111000190,Ativa,RUA A,6201501,,São Carlos,SP,a@a.com,(16) 999,\n\
             FORA,33333333000190,Ativa,RUA C,4721102,,São Carlos,SP,,,\n",
        )
        .unwrap();

        let saida = dir.path().join("refiltrada.csv");
        let config = CnaeConfig {
            input: entrada.to_str().unwrap().to_string(),
            output: saida.to_str().unwrap().to_string(),
            cnaes: vec!["6201-5/01".to_string()],
            chunksize: 300_000,
            auto_yes: true,
        };
        run(&config).unwrap();

        let conteudo = fs::read_to_string(&saida).unwrap();
        let linhas: Vec<&str> = conteudo.lines().collect();
        assert_eq!(
            linhas[0],
            "nome,cnpj,situacao,endereco,cnae_fiscal_principal,cnaes_secundarios,match_por,municipio,uf,email,telefone_1,telefone_2"
        );
        assert_eq!(linhas.len(), 3);
        assert!(linhas[1].starts_with("ALFA,"));
        assert!(linhas[1].contains(",principal,"));
        assert!(linhas[1].ends_with("a@a.com,(16) 999,"));
        assert!(linhas[2].starts_with("ZULU,"));
        assert!(linhas[2].contains(",secundario,"));
    }

    #[test]
    fn run_sem_resultado_escreve_so_o_cabecalho() {
        let dir = tempfile::tempdir().unwrap();
        let entrada = dir.path().join("base.csv");
        fs::write(
            &entrada,
            "nome,cnpj,endereco,cnae_fiscal_principal,cnaes_secundarios,municipio,uf\n\
             ALFA,1,RUA A,4721102,,São Carlos,SP\n",
        )
        .unwrap();

        let saida = dir.path().join("refiltrada.csv");
        let config = CnaeConfig {
            input: entrada.to_str().unwrap().to_string(),
            output: saida.to_str().unwrap().to_string(),
            cnaes: vec!["6201501".to_string()],
            chunksize: 300_000,
            auto_yes: true,
        };
        run(&config).unwrap();

        let conteudo = fs::read_to_string(&saida).unwrap();
        assert_eq!(
            conteudo.trim_end(),
            "nome,cnpj,endereco,cnae_fiscal_principal,cnaes_secundarios,match_por,municipio,uf"
        );
    }

    #[test]
    fn run_exige_as_colunas_da_base_filtrada() {
        let dir = tempfile::tempdir().unwrap();
        let entrada = dir.path().join("base.csv");
        fs::write(
            &entrada,
            "nome,cnpj,cnae_fiscal_principal,cnaes_secundarios\nALFA,1,6201501,\n",
        )
        .unwrap();

        let config = CnaeConfig {
            input: entrada.to_str().unwrap().to_string(),
            output: dir.path().join("refiltrada.csv").to_str().unwrap().to_string(),
            cnaes: vec!["6201501".to_string()],
            chunksize: 300_000,
            auto_yes: true,
        };
        let err = run(&config).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("endereco"));
        assert!(msg.contains("municipio"));
        assert!(msg.contains("uf"));
    }
}
