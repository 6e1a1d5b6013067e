use anyhow::Result;
use chrono::Local;
use indicatif::{ProgressBar, ProgressStyle};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use crate::checkpoint::{self, AtomicCsv};
use crate::cnae;
use crate::models::{Estabelecimento, Municipio, SituacaoCadastral};
use crate::schema;
use crate::ui;
use crate::utils;

pub struct FiltroConfig {
    pub input_dir: String,
    pub output: String,
    pub cidades: Vec<String>,
    pub uf: String,
    pub cnaes: Vec<String>,
    pub chunksize: usize,
    pub auto_yes: bool,
}

struct LinhaSaida {
    nome: String,
    cnpj: String,
    situacao: &'static str,
    endereco: String,
    cnae_fiscal: String,
    cnae_secundaria: String,
    match_por: &'static str,
    municipio: String,
    uf: String,
    email: String,
    telefone_1: String,
    telefone_2: String,
}

/// Resolve as cidades digitadas contra a tabela de municípios, preservando a
/// grafia digitada como forma de exibição. Cidade sem correspondência é fatal.
fn resolve_municipios_alvo(
    municipios: &[Municipio],
    cidades: &[String],
    uf: &str,
) -> Result<HashMap<String, String>> {
    let uf_norm = utils::normalize_lookup(uf);
    let display_por_norm: HashMap<String, &String> = cidades
        .iter()
        .map(|cidade| (utils::normalize_lookup(cidade), cidade))
        .collect();
    let tabela_tem_uf = municipios.iter().any(|m| m.uf.is_some());

    let mut codigo_para_display = HashMap::new();
    let mut encontradas: HashSet<String> = HashSet::new();
    for municipio in municipios {
        let nome_norm = utils::normalize_lookup(&municipio.nome);
        let Some(display) = display_por_norm.get(&nome_norm) else {
            continue;
        };
        if tabela_tem_uf {
            match &municipio.uf {
                Some(u) if utils::normalize_lookup(u) == uf_norm => {}
                _ => continue,
            }
        }
        codigo_para_display.insert(municipio.codigo.clone(), (*display).clone());
        encontradas.insert(nome_norm);
    }

    let faltando: Vec<&str> = cidades
        .iter()
        .filter(|cidade| !encontradas.contains(&utils::normalize_lookup(cidade)))
        .map(|cidade| cidade.as_str())
        .collect();
    if !faltando.is_empty() {
        anyhow::bail!(
            "Nenhum município encontrado na tabela para: {} (UF {})",
            faltando.join(", "),
            uf
        );
    }
    Ok(codigo_para_display)
}

/// Endereço de exibição: "TIPO LOGRADOURO, NUMERO - COMPLEMENTO - BAIRRO -
/// Cidade/UF - CEP 00000-000", omitindo as partes vazias.
fn monta_endereco(est: &Estabelecimento, municipio: &str, uf: &str) -> String {
    let mut partes = String::new();
    let tipo = est.tipo_logradouro.trim();
    let logradouro = est.logradouro.trim();
    let numero = est.numero.trim();
    let complemento = est.complemento.trim();
    let bairro = est.bairro.trim();
    let cep = utils::only_digits(&est.cep);

    if !tipo.is_empty() {
        partes.push_str(tipo);
        partes.push(' ');
    }
    if !logradouro.is_empty() {
        partes.push_str(logradouro);
    }
    if !numero.is_empty() {
        partes.push_str(", ");
        partes.push_str(numero);
    }
    if !complemento.is_empty() {
        partes.push_str(" - ");
        partes.push_str(complemento);
    }
    if !bairro.is_empty() {
        partes.push_str(" - ");
        partes.push_str(bairro);
    }
    if !municipio.is_empty() {
        partes.push_str(" - ");
        partes.push_str(municipio);
    }
    if !uf.is_empty() {
        partes.push('/');
        partes.push_str(uf);
    }
    if !cep.is_empty() {
        if cep.len() == 8 {
            partes.push_str(&format!(" - CEP {}-{}", &cep[..5], &cep[5..]));
        } else {
            partes.push_str(&format!(" - CEP {}", cep));
        }
    }
    partes
        .trim_matches(|c| c == ' ' || c == '-' || c == ',')
        .to_string()
}

fn monta_telefone(ddd: &str, numero: &str) -> String {
    let ddd = ddd.trim();
    let numero = numero.trim();
    if numero.is_empty() {
        String::new()
    } else if ddd.is_empty() {
        numero.to_string()
    } else {
        format!("({}) {}", ddd, numero)
    }
}

fn write_header(writer: &mut csv::Writer<fs::File>, com_cnae: bool) -> Result<()> {
    let mut cols = vec![
        "nome",
        "cnpj",
        "situacao",
        "endereco",
        "cnae_fiscal_principal",
        "cnaes_secundarios",
    ];
    if com_cnae {
        cols.push("match_por");
    }
    cols.extend(["municipio", "uf", "email", "telefone_1", "telefone_2"]);
    writer.write_record(&cols)?;
    Ok(())
}

/// Ordena o lote por (nome, cnpj) e grava. A ordenação vale dentro de cada
/// chunk, como a saída é incremental.
fn flush_chunk(
    buffer: &mut Vec<LinhaSaida>,
    writer: &mut csv::Writer<fs::File>,
    com_cnae: bool,
) -> Result<()> {
    if buffer.is_empty() {
        return Ok(());
    }
    buffer.sort_by(|a, b| a.nome.cmp(&b.nome).then_with(|| a.cnpj.cmp(&b.cnpj)));
    for linha in buffer.drain(..) {
        let mut campos: Vec<&str> = vec![
            &linha.nome,
            &linha.cnpj,
            linha.situacao,
            &linha.endereco,
            &linha.cnae_fiscal,
            &linha.cnae_secundaria,
        ];
        if com_cnae {
            campos.push(linha.match_por);
        }
        campos.extend([
            linha.municipio.as_str(),
            linha.uf.as_str(),
            linha.email.as_str(),
            linha.telefone_1.as_str(),
            linha.telefone_2.as_str(),
        ]);
        writer.write_record(&campos)?;
    }
    Ok(())
}

pub fn run(config: &FiltroConfig) -> Result<()> {
    ui::print_header("🔎 Filtro de estabelecimentos por cidade e situação");
    ui::print_info(&format!(
        "Hora de início: {}",
        Local::now().format("%Y-%m-%d %H:%M:%S")
    ));
    ui::print_info(&format!("Diretório de entrada: {}", config.input_dir));
    ui::print_info(&format!(
        "Cidades: {} | UF: {}",
        config.cidades.join(", "),
        config.uf
    ));
    ui::print_info(&format!("Chunk: {} linhas", config.chunksize));

    let cnaes_alvo = if config.cnaes.is_empty() {
        None
    } else {
        let lista = cnae::normalize_cnae_list(&config.cnaes)?;
        ui::print_info(&format!("CNAEs alvo: {}", lista.join(", ")));
        Some(lista.into_iter().collect::<HashSet<String>>())
    };
    let com_cnae = cnaes_alvo.is_some();
    let re_sete = Regex::new(r"\d{7}")?;

    let munic_files = utils::get_files_by_pattern(&config.input_dir, "*MUNICCSV*")?;
    let munic_path = munic_files.first().ok_or_else(|| {
        anyhow::anyhow!(
            "Nenhum arquivo *MUNICCSV* encontrado em {}",
            config.input_dir
        )
    })?;
    ui::print_verbose(&format!("Tabela de municípios: {:?}", munic_path));
    let municipios = schema::load_municipios(munic_path)?;
    let codigo_para_display = resolve_municipios_alvo(&municipios, &config.cidades, &config.uf)?;
    {
        let mut codigos: Vec<&str> = codigo_para_display.keys().map(|c| c.as_str()).collect();
        codigos.sort_unstable();
        ui::print_info(&format!("Códigos de município alvo: {}", codigos.join(", ")));
    }

    let est_files = utils::get_files_by_pattern(&config.input_dir, "*.ESTABELE*")?;
    if est_files.is_empty() {
        anyhow::bail!(
            "Nenhum arquivo *.ESTABELE* encontrado em {}",
            config.input_dir
        );
    }
    ui::print_success(&format!(
        "{} arquivo(s) de estabelecimentos encontrado(s)",
        est_files.len()
    ));

    let out_path = Path::new(&config.output);
    if !checkpoint::confirm_overwrite(out_path, config.auto_yes)? {
        ui::print_info("Operação cancelada pelo usuário.");
        return Ok(());
    }

    let mut atomic = AtomicCsv::create(out_path)?;
    write_header(atomic.writer(), com_cnae)?;

    let uf_norm = utils::normalize_lookup(&config.uf);
    let mut seen_cnpjs: HashSet<String> = HashSet::new();
    let mut buffer: Vec<LinhaSaida> = Vec::new();
    let mut total_lidas = 0u64;
    let mut mantidas = 0u64;
    let mut malformadas = 0u64;

    ui::print_separator();
    for (idx, est_path) in est_files.iter().enumerate() {
        let nome_arquivo = est_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("arquivo");
        ui::print_step(idx + 1, est_files.len(), &format!("Processando {}", nome_arquivo));

        let layout = match schema::detect_estabelecimento_layout(est_path)? {
            Some(layout) => layout,
            None => {
                ui::print_warning(&format!("{} está vazio; ignorado.", nome_arquivo));
                continue;
            }
        };
        ui::print_verbose(&format!("Layout detectado: {} colunas", layout));

        // Estimativa: ~200 bytes por linha
        let tamanho = fs::metadata(est_path)?.len();
        let pb = ProgressBar::new((tamanho / 200).max(1));
        pb.set_style(
            ProgressStyle::default_bar()
                .template("  [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) | {msg}")?
                .progress_chars("#>-"),
        );

        let mut rdr = utils::latin1_csv_reader(est_path)?;
        let mut lidas_arquivo = 0u64;
        let mut no_chunk = 0usize;

        for result in rdr.records() {
            total_lidas += 1;
            lidas_arquivo += 1;
            no_chunk += 1;

            if lidas_arquivo % 10_000 == 0 {
                pb.set_position(lidas_arquivo);
                pb.set_message(format!("{} mantidas", mantidas));
            }

            if no_chunk >= config.chunksize {
                flush_chunk(&mut buffer, atomic.writer(), com_cnae)?;
                no_chunk = 0;
            }

            let record = match result {
                Ok(r) => r,
                Err(_) => {
                    malformadas += 1;
                    continue;
                }
            };
            let Some(est) = schema::decode_estabelecimento(&record, layout) else {
                malformadas += 1;
                continue;
            };

            let situacao = SituacaoCadastral::from_codigo(&est.situacao_cadastral);
            if situacao != SituacaoCadastral::Ativa {
                continue;
            }
            if utils::normalize_lookup(&est.uf) != uf_norm {
                continue;
            }
            let Some(display) = codigo_para_display.get(&est.codigo_municipio) else {
                continue;
            };

            let match_por = match &cnaes_alvo {
                None => "",
                Some(alvo) => {
                    match cnae::classify(&est.cnae_fiscal, &est.cnae_fiscal_secundaria, alvo, &re_sete)
                    {
                        Some(tag) => tag.as_str(),
                        None => continue,
                    }
                }
            };

            let cnpj = format!(
                "{}{}{}",
                utils::zfill(&est.cnpj_basico, 8),
                utils::zfill(&est.cnpj_ordem, 4),
                utils::zfill(&est.cnpj_dv, 2)
            );
            if !seen_cnpjs.insert(cnpj.clone()) {
                continue;
            }

            let endereco = monta_endereco(&est, display, &config.uf);
            buffer.push(LinhaSaida {
                nome: est.nome_fantasia.clone(),
                cnpj,
                situacao: situacao.rotulo(),
                endereco,
                cnae_fiscal: est.cnae_fiscal.clone(),
                cnae_secundaria: est.cnae_fiscal_secundaria.clone(),
                match_por,
                municipio: display.clone(),
                uf: config.uf.clone(),
                email: est.correio_eletronico.clone(),
                telefone_1: monta_telefone(&est.ddd1, &est.telefone1),
                telefone_2: monta_telefone(&est.ddd2, &est.telefone2),
            });
            mantidas += 1;
        }

        // chunks não atravessam arquivos
        flush_chunk(&mut buffer, atomic.writer(), com_cnae)?;
        pb.set_position(lidas_arquivo);
        pb.finish_with_message(format!("{} linha(s) | {} mantidas até aqui", lidas_arquivo, mantidas));
    }

    atomic.promote()?;

    ui::print_separator();
    ui::print_success("Filtragem concluída!");
    ui::print_info(&format!("Arquivo criado: {}", config.output));
    ui::print_info(&format!(
        "Hora de término: {}",
        Local::now().format("%Y-%m-%d %H:%M:%S")
    ));
    ui::print_statistics(&[
        ("Arquivos processados", est_files.len() as u64),
        ("Linhas lidas", total_lidas),
        ("Estabelecimentos mantidos", mantidas),
        ("Linhas malformadas ignoradas", malformadas),
    ]);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn est_basico() -> Estabelecimento {
        Estabelecimento {
            cnpj_basico: "12345678".into(),
            cnpj_ordem: "1".into(),
            cnpj_dv: "90".into(),
            matriz_filial: "1".into(),
            nome_fantasia: "PADARIA DO ZE".into(),
            situacao_cadastral: "02".into(),
            data_situacao_cadastral: String::new(),
            motivo_situacao_cadastral: String::new(),
            nome_cidade_exterior: String::new(),
            pais: String::new(),
            data_inicio_atividades: String::new(),
            cnae_fiscal: "4721102".into(),
            cnae_fiscal_secundaria: String::new(),
            tipo_logradouro: "RUA".into(),
            logradouro: "DAS FLORES".into(),
            numero: "100".into(),
            complemento: "SALA 2".into(),
            bairro: "CENTRO".into(),
            cep: "13560001".into(),
            uf: "SP".into(),
            codigo_municipio: "6477".into(),
            municipio: "SAO CARLOS".into(),
            ddd1: "16".into(),
            telefone1: "33719999".into(),
            ddd2: String::new(),
            telefone2: String::new(),
            ddd_fax: String::new(),
            fax: String::new(),
            correio_eletronico: "ze@padaria.com".into(),
            situacao_especial: String::new(),
            data_situacao_especial: String::new(),
        }
    }

    #[test]
    fn monta_endereco_completo() {
        let est = est_basico();
        assert_eq!(
            monta_endereco(&est, "São Carlos", "SP"),
            "RUA DAS FLORES, 100 - SALA 2 - CENTRO - São Carlos/SP - CEP 13560-001"
        );
    }

    #[test]
    fn monta_endereco_parcial_sem_pontas_soltas() {
        let mut est = est_basico();
        est.numero.clear();
        est.complemento.clear();
        est.cep.clear();
        assert_eq!(
            monta_endereco(&est, "São Carlos", "SP"),
            "RUA DAS FLORES - CENTRO - São Carlos/SP"
        );

        est.tipo_logradouro.clear();
        est.logradouro.clear();
        est.bairro.clear();
        assert_eq!(monta_endereco(&est, "São Carlos", "SP"), "São Carlos/SP");
    }

    #[test]
    fn monta_endereco_cep_fora_do_padrao_fica_cru() {
        let mut est = est_basico();
        est.cep = "1356".into();
        assert!(monta_endereco(&est, "São Carlos", "SP").ends_with("CEP 1356"));
    }

    #[test]
    fn monta_telefone_com_e_sem_ddd() {
        assert_eq!(monta_telefone("16", "33719999"), "(16) 33719999");
        assert_eq!(monta_telefone("", "33719999"), "33719999");
        assert_eq!(monta_telefone("16", ""), "");
    }

    #[test]
    fn resolve_municipios_usa_grafia_digitada_e_exige_todas() {
        let municipios = vec![
            Municipio {
                codigo: "6477".into(),
                nome: "SAO CARLOS".into(),
                uf: None,
            },
            Municipio {
                codigo: "9999".into(),
                nome: "SAO CARLOS".into(),
                uf: None,
            },
            Municipio {
                codigo: "6213".into(),
                nome: "IBATE".into(),
                uf: None,
            },
        ];
        let mapa =
            resolve_municipios_alvo(&municipios, &["São Carlos".to_string()], "SP").unwrap();
        assert_eq!(mapa.len(), 2);
        assert_eq!(mapa.get("6477").map(|s| s.as_str()), Some("São Carlos"));

        let err = resolve_municipios_alvo(
            &municipios,
            &["São Carlos".to_string(), "Araraquara".to_string()],
            "SP",
        )
        .unwrap_err();
        assert!(err.to_string().contains("Araraquara"));
    }

    #[test]
    fn resolve_municipios_filtra_por_uf_quando_a_tabela_traz() {
        let municipios = vec![
            Municipio {
                codigo: "6477".into(),
                nome: "SAO CARLOS".into(),
                uf: Some("SP".into()),
            },
            Municipio {
                codigo: "1111".into(),
                nome: "SAO CARLOS".into(),
                uf: Some("SC".into()),
            },
        ];
        let mapa =
            resolve_municipios_alvo(&municipios, &["São Carlos".to_string()], "SP").unwrap();
        assert_eq!(mapa.len(), 1);
        assert!(mapa.contains_key("6477"));
    }

    fn linha_estabele(
        basico: &str,
        ordem: &str,
        nome: &str,
        situacao: &str,
        cnae: &str,
        secundarios: &str,
        uf: &str,
        cod_munic: &str,
    ) -> String {
        let mut campos = vec![String::new(); 30];
        campos[0] = basico.into();
        campos[1] = ordem.into();
        campos[2] = "90".into();
        campos[4] = nome.into();
        campos[5] = situacao.into();
        campos[11] = cnae.into();
        campos[12] = secundarios.into();
        campos[13] = "RUA".into();
        campos[14] = "DAS FLORES".into();
        campos[15] = "100".into();
        campos[18] = "13560001".into();
        campos[19] = uf.into();
        campos[20] = cod_munic.into();
        campos[27] = "contato@empresa.com".into();
        campos.join(";")
    }

    #[test]
    fn run_filtra_deduplica_e_ordena() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_str().unwrap().to_string();

        fs::write(dir.path().join("F.MUNICCSV"), "6477;SAO CARLOS\n6213;IBATE\n").unwrap();

        let linhas = [
            linha_estabele("22222222", "1", "ZULU LTDA", "02", "6201501", "", "SP", "6477"),
            linha_estabele("11111111", "1", "ALFA LTDA", "02", "4721102", "", "SP", "6477"),
            // baixada: fica de fora
            linha_estabele("33333333", "1", "BAIXADA", "08", "4721102", "", "SP", "6477"),
            // outra cidade e outra UF: ficam de fora
            linha_estabele("44444444", "1", "OUTRA CIDADE", "02", "4721102", "", "SP", "9999"),
            linha_estabele("55555555", "1", "OUTRA UF", "02", "4721102", "", "MG", "6477"),
            "so;tres;campos".to_string(),
        ]
        .join("\n");
        fs::write(dir.path().join("K1.ESTABELE"), linhas).unwrap();

        // segundo arquivo repete um cnpj já visto
        fs::write(
            dir.path().join("K2.ESTABELE"),
            linha_estabele("11111111", "1", "ALFA LTDA", "02", "4721102", "", "SP", "6477"),
        )
        .unwrap();

        let saida = dir.path().join("filtradas.csv");
        let config = FiltroConfig {
            input_dir: base,
            output: saida.to_str().unwrap().to_string(),
            cidades: vec!["São Carlos".to_string()],
            uf: "SP".to_string(),
            cnaes: vec![],
            chunksize: 300_000,
            auto_yes: true,
        };
        run(&config).unwrap();

        let conteudo = fs::read_to_string(&saida).unwrap();
        let linhas: Vec<&str> = conteudo.lines().collect();
        assert_eq!(
            linhas[0],
            "nome,cnpj,situacao,endereco,cnae_fiscal_principal,cnaes_secundarios,municipio,uf,email,telefone_1,telefone_2"
        );
        // só as duas ativas de São Carlos, ordenadas por nome
        assert_eq!(linhas.len(), 3);
        assert!(linhas[1].starts_with("ALFA LTDA,11111111000190,Ativa,"));
        assert!(linhas[2].starts_with("ZULU LTDA,22222222000190,Ativa,"));
        assert!(linhas[1].contains("São Carlos/SP"));
        assert!(linhas[1].contains("São Carlos,SP,contato@empresa.com"));
        assert!(!dir.path().join("filtradas.csv.tmp").exists());
    }

    #[test]
    fn run_com_cnae_classifica_e_descarta() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_str().unwrap().to_string();

        fs::write(dir.path().join("F.MUNICCSV"), "6477;SAO CARLOS\n").unwrap();
        let linhas = [
            linha_estabele("11111111", "1", "SO PRINCIPAL", "02", "6201501", "", "SP", "6477"),
            linha_estabele(
                "22222222",
                "1",
                "SO SECUNDARIO",
                "02",
                "4721102",
                "6201501,9999999",
                "SP",
                "6477",
            ),
            linha_estabele(
                "33333333",
                "1",
                "AMBOS",
                "02",
                "6201501",
                "6201501",
                "SP",
                "6477",
            ),
            linha_estabele("44444444", "1", "NENHUM", "02", "4721102", "", "SP", "6477"),
        ]
        .join("\n");
        fs::write(dir.path().join("K1.ESTABELE"), linhas).unwrap();

        let saida = dir.path().join("filtradas.csv");
        let config = FiltroConfig {
            input_dir: base,
            output: saida.to_str().unwrap().to_string(),
            cidades: vec!["São Carlos".to_string()],
            uf: "SP".to_string(),
            cnaes: vec!["6201-5/01".to_string()],
            chunksize: 300_000,
            auto_yes: true,
        };
        run(&config).unwrap();

        let conteudo = fs::read_to_string(&saida).unwrap();
        let linhas: Vec<&str> = conteudo.lines().collect();
        assert!(linhas[0].contains("cnaes_secundarios,match_por,municipio"));
        assert_eq!(linhas.len(), 4);
        assert!(linhas[1].starts_with("AMBOS,"));
        assert!(linhas[1].contains(",ambos,"));
        assert!(linhas[2].starts_with("SO PRINCIPAL,"));
        assert!(linhas[2].contains(",principal,"));
        assert!(linhas[3].starts_with("SO SECUNDARIO,"));
        assert!(linhas[3].contains(",secundario,"));
    }
}
