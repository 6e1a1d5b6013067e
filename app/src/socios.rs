use anyhow::{Context, Result};
use chrono::Local;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use crate::checkpoint::{self, AtomicCsv};
use crate::models::{self, SocioResumo};
use crate::schema;
use crate::ui;
use crate::utils;

pub struct SociosConfig {
    pub input: String,
    pub input_dir: String,
    pub output: String,
    pub only: Option<String>,
    pub max_n: Option<u64>,
    pub chunksize: usize,
    pub auto_yes: bool,
}

/// Colunas da base que seguem adiante quando existem, nesta ordem.
const PASSTHROUGH: [&str; 5] = [
    "razao_social",
    "nome",
    "endereco",
    "porte_empresa_txt",
    "capital_social",
];

fn decode_ou_cru(
    mapa: &HashMap<String, String>,
    codigo: &str,
    desconhecidos: &mut u64,
) -> String {
    let cru = codigo.trim();
    if cru.is_empty() {
        return String::new();
    }
    match schema::decode_codigo(mapa, cru) {
        Some(txt) => txt.to_string(),
        None => {
            *desconhecidos += 1;
            cru.to_string()
        }
    }
}

pub fn run(config: &SociosConfig) -> Result<()> {
    ui::print_header("👥 Agregação do quadro societário");
    ui::print_info(&format!(
        "Hora de início: {}",
        Local::now().format("%Y-%m-%d %H:%M:%S")
    ));
    ui::print_info(&format!("Base: {}", config.input));
    ui::print_info(&format!("Diretório dos dados abertos: {}", config.input_dir));

    let filtro_identificador: Option<(&'static str, &'static str)> = match &config.only {
        None => None,
        Some(valor) => match valor.to_uppercase().as_str() {
            "PF" => Some(("2", "Pessoa Física")),
            "PJ" => Some(("1", "Pessoa Jurídica")),
            "EXT" => Some(("3", "Estrangeiro")),
            outro => anyhow::bail!("Valor inválido para --only: {} (use PF, PJ ou EXT)", outro),
        },
    };
    if let Some((_, rotulo)) = filtro_identificador {
        ui::print_info(&format!("Somente sócios: {}", rotulo));
    }
    if let Some(max) = config.max_n {
        ui::print_info(&format!("Limite de linhas de sócios varridas: {}", max));
    }

    let input_path = Path::new(&config.input);
    let header = checkpoint::validate_columns(input_path, &["cnpj"])?;
    let idx_cnpj = header.iter().position(|h| h == "cnpj").unwrap_or(0);
    let passthrough: Vec<(usize, &str)> = PASSTHROUGH
        .iter()
        .filter_map(|nome| header.iter().position(|h| h == nome).map(|i| (i, *nome)))
        .collect();

    ui::print_step(1, 3, "Lendo a base");
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

    let paises = match utils::get_files_by_pattern(&config.input_dir, "*PAISCSV*")?.first() {
        Some(path) => schema::load_codigo_map(path)
            .with_context(|| format!("Falha ao ler {:?}", path))?,
        None => {
            ui::print_warning(
                "Tabela de países (*PAISCSV*) não encontrada; códigos crus serão mantidos.",
            );
            HashMap::new()
        }
    };

    let soc_files = utils::get_files_by_pattern(&config.input_dir, "*.SOCIOCSV*")?;
    if soc_files.is_empty() {
        anyhow::bail!(
            "Nenhum arquivo *.SOCIOCSV* encontrado em {}",
            config.input_dir
        );
    }

    ui::print_step(2, 3, "Varrendo os arquivos de sócios");
    let mut socios_por_empresa: HashMap<String, Vec<SocioResumo>> = HashMap::new();
    let mut representantes: HashMap<String, (String, String)> = HashMap::new();
    let mut socios_lidos = 0u64;
    let mut agregados = 0u64;
    let mut descartados_filtro = 0u64;
    let mut malformadas_soc = 0u64;
    let mut quals_desconhecidas = 0u64;
    let mut paises_desconhecidos = 0u64;
    let mut limite_atingido = false;

    for (idx, soc_path) in soc_files.iter().enumerate() {
        if limite_atingido {
            break;
        }
        let nome_arquivo = soc_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("arquivo");
        ui::print_verbose(&format!(
            "Arquivo {}/{}: {}",
            idx + 1,
            soc_files.len(),
            nome_arquivo
        ));

        let tamanho = fs::metadata(soc_path)?.len();
        let pb = ProgressBar::new((tamanho / 200).max(1));
        pb.set_style(
            ProgressStyle::default_bar()
                .template("  [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) | {msg}")?
                .progress_chars("#>-"),
        );

        let mut rdr = utils::latin1_csv_reader(soc_path)?;
        let mut lidas_arquivo = 0u64;
        let mut no_chunk = 0usize;
        for result in rdr.records() {
            socios_lidos += 1;
            lidas_arquivo += 1;
            if lidas_arquivo % 10_000 == 0 {
                pb.set_position(lidas_arquivo);
                pb.set_message(format!("{} agregados", agregados));
            }

            match result {
                Ok(record) => {
                    if let Some(socio) = schema::decode_socio(&record) {
                        if necessarios.contains(&socio.cnpj_basico) {
                            let passa_filtro = match filtro_identificador {
                                None => true,
                                Some((codigo, _)) => {
                                    socio.identificador_de_socio.trim() == codigo
                                }
                            };
                            if !passa_filtro {
                                descartados_filtro += 1;
                            } else {
                                // cada linha do SOCIOCSV vira uma entrada do
                                // quadro; homônimos são sócios distintos
                                let qualificacao = decode_ou_cru(
                                    &quals,
                                    &socio.qualificacao_socio,
                                    &mut quals_desconhecidas,
                                );
                                let pais = decode_ou_cru(
                                    &paises,
                                    &socio.pais,
                                    &mut paises_desconhecidos,
                                );
                                socios_por_empresa
                                    .entry(socio.cnpj_basico.clone())
                                    .or_default()
                                    .push(SocioResumo {
                                        nome: socio.nome_socio.clone(),
                                        identificador: models::identificador_socio_txt(
                                            &socio.identificador_de_socio,
                                        )
                                        .to_string(),
                                        qualificacao,
                                        pais,
                                        faixa_etaria: socio.faixa_etaria.clone(),
                                        data_entrada: socio.data_entrada_sociedade.clone(),
                                    });
                                agregados += 1;

                                let representante = socio.nome_representante.trim();
                                if !representante.is_empty()
                                    && !representantes.contains_key(&socio.cnpj_basico)
                                {
                                    let qualificacao_rep = decode_ou_cru(
                                        &quals,
                                        &socio.qualificacao_representante_legal,
                                        &mut quals_desconhecidas,
                                    );
                                    representantes.insert(
                                        socio.cnpj_basico.clone(),
                                        (representante.to_string(), qualificacao_rep),
                                    );
                                }
                            }
                        }
                    } else {
                        malformadas_soc += 1;
                    }
                }
                Err(_) => malformadas_soc += 1,
            }

            // o limite é conferido na fronteira dos chunks
            no_chunk += 1;
            if no_chunk >= config.chunksize {
                no_chunk = 0;
                if let Some(max) = config.max_n {
                    if socios_lidos >= max {
                        limite_atingido = true;
                        break;
                    }
                }
            }
        }
        pb.set_position(lidas_arquivo);
        if limite_atingido {
            pb.finish_with_message("limite de varredura atingido");
        } else {
            pb.finish_with_message(format!("{} agregados", agregados));
        }
    }

    let out_path = Path::new(&config.output);
    if !checkpoint::confirm_overwrite(out_path, config.auto_yes)? {
        ui::print_info("Operação cancelada pelo usuário.");
        return Ok(());
    }

    ui::print_step(3, 3, "Gravando a base com o quadro societário");
    let mut atomic = AtomicCsv::create(out_path)?;
    let mut header_saida: Vec<&str> = vec!["cnpj"];
    header_saida.extend(passthrough.iter().map(|(_, nome)| *nome));
    header_saida.extend([
        "n_socios",
        "socios",
        "representante_legal",
        "qualificacao_representante",
    ]);
    atomic.writer().write_record(&header_saida)?;

    let vazio: Vec<SocioResumo> = Vec::new();
    let mut vistos: HashSet<String> = HashSet::new();
    let mut com_socios = 0u64;
    let mut sem_socios = 0u64;
    for record in &registros {
        let cnpj = record.get(idx_cnpj).unwrap_or("").trim().to_string();
        if !vistos.insert(cnpj.clone()) {
            continue;
        }
        let basico = utils::cnpj_basico(&cnpj);
        let lista = socios_por_empresa.get(&basico).unwrap_or(&vazio);
        if lista.is_empty() {
            sem_socios += 1;
        } else {
            com_socios += 1;
        }

        let mut linha: Vec<String> = vec![cnpj];
        for (idx, _) in &passthrough {
            linha.push(record.get(*idx).unwrap_or("").to_string());
        }
        let (representante, qualificacao_rep) = representantes
            .get(&basico)
            .map(|(nome, qual)| (nome.as_str(), qual.as_str()))
            .unwrap_or(("", ""));
        linha.push(lista.len().to_string());
        linha.push(serde_json::to_string(lista)?);
        linha.push(representante.to_string());
        linha.push(qualificacao_rep.to_string());
        atomic.writer().write_record(&linha)?;
    }
    atomic.promote()?;

    if quals_desconhecidas > 0 {
        ui::print_warning(&format!(
            "{} sócio(s) com qualificação fora da tabela; o código cru foi mantido.",
            quals_desconhecidas
        ));
    }
    if paises_desconhecidos > 0 {
        ui::print_warning(&format!(
            "{} sócio(s) com país fora da tabela; o código cru foi mantido.",
            paises_desconhecidos
        ));
    }

    ui::print_separator();
    ui::print_success("Quadro societário agregado!");
    ui::print_info(&format!("Arquivo criado: {}", config.output));
    ui::print_statistics(&[
        ("Linhas da base", registros.len() as u64),
        ("Linhas de sócios varridas", socios_lidos),
        ("Sócios agregados", agregados),
        ("Descartados pelo filtro --only", descartados_filtro),
        ("Empresas com sócios", com_socios),
        ("Empresas sem sócios", sem_socios),
        ("Linhas malformadas na base", malformadas_base),
        ("Linhas malformadas em sócios", malformadas_soc),
    ]);

    Ok(())
}
