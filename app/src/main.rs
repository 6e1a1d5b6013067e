mod checkpoint;
mod cnae;
mod empresas;
mod filtro;
mod geocode;
mod mapa;
mod models;
mod nominatim;
mod schema;
mod socios;
mod ui;
mod utils;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "cnpj-mapa")]
#[command(about = "Filtra, enriquece e geocodifica os dados abertos do CNPJ para gerar mapas de empresas", long_about = None)]
struct Cli {
    /// Pula todas as confirmações interativas (yes para tudo)
    #[arg(long, global = true)]
    yes: bool,

    /// Modo silencioso (menos saída)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Modo verboso (mais detalhes)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Filtra os estabelecimentos ativos por cidade(s) e UF
    Filtrar {
        /// Pasta com os arquivos dos dados abertos (ESTABELE, MUNICCSV...)
        #[arg(short, long, default_value = "dados-publicos")]
        input_dir: String,
        /// Nome da cidade (repita a opção para mais de uma)
        #[arg(short, long, required = true)]
        cidade: Vec<String>,
        /// UF a filtrar (ex.: SP)
        #[arg(long)]
        uf: String,
        /// CNAEs de 7 dígitos para filtrar junto (opcional)
        #[arg(long)]
        cnae: Vec<String>,
        /// Arquivo de saída
        #[arg(short, long, default_value = "empresas_ativas_filtradas.csv")]
        output: String,
        /// Tamanho do chunk (linhas)
        #[arg(long, default_value = "300000")]
        chunksize: usize,
    },
    /// Refiltra uma saída do filtrar por uma lista de CNAEs
    FiltrarCnae {
        /// CSV do passo anterior (precisa das colunas de CNAE)
        #[arg(short, long)]
        input: String,
        /// CNAEs de 7 dígitos, separados por espaço e/ou vírgula
        #[arg(long, required = true)]
        cnae: Vec<String>,
        /// Arquivo de saída
        #[arg(short, long, default_value = "empresas_filtradas_por_cnae.csv")]
        output: String,
        /// Tamanho do chunk (linhas)
        #[arg(long, default_value = "300000")]
        chunksize: usize,
    },
    /// Enriquece a base filtrada com razão social, porte e capital
    Empresas {
        /// CSV de entrada com a coluna cnpj
        #[arg(short, long)]
        input: String,
        /// Pasta com os arquivos dos dados abertos (EMPRECSV, QUALSCSV)
        #[arg(long, default_value = "dados-publicos")]
        input_dir: String,
        /// Arquivo de saída
        #[arg(short, long, default_value = "empresas_enriquecidas.csv")]
        output: String,
    },
    /// Agrega o quadro societário na base enriquecida
    Socios {
        /// CSV de entrada com a coluna cnpj
        #[arg(short, long)]
        input: String,
        /// Pasta com os arquivos dos dados abertos (SOCIOCSV, QUALSCSV, PAISCSV)
        #[arg(long, default_value = "dados-publicos")]
        input_dir: String,
        /// Arquivo de saída
        #[arg(short, long, default_value = "empresas_com_socios.csv")]
        output: String,
        /// Mantém apenas um tipo de sócio: PF, PJ ou EXT
        #[arg(long)]
        only: Option<String>,
        /// Limita o total de linhas de sócios varridas (depuração)
        #[arg(long)]
        max_n: Option<u64>,
        /// Tamanho do chunk (linhas)
        #[arg(long, default_value = "300000")]
        chunksize: usize,
    },
    /// Geocodifica os endereços e monta o JSON final do mapa
    Mapa {
        /// CSV base (colunas: nome, cnpj, endereco)
        #[arg(short, long)]
        base: String,
        /// CSV enriquecido opcional (ex.: empresas_com_socios.csv)
        #[arg(short, long)]
        enriquecida: Option<String>,
        /// CSV de cache de geocodificação
        #[arg(long, default_value = "geocache_enderecos.csv")]
        geocache: String,
        /// Caminho do JSON de saída
        #[arg(short, long)]
        out_json: String,
        /// CSV de falhas de geocodificação
        #[arg(long, default_value = "geocode_falhas.csv")]
        log_falhas: String,
        /// JSONL com as tentativas por endereço (opcional)
        #[arg(long)]
        debug_candidatos: Option<String>,
        /// Cidade usada nas consultas e na validação dos resultados
        #[arg(long, default_value = "São Carlos")]
        cidade: String,
        /// UF usada nas consultas e na validação dos resultados
        #[arg(long, default_value = "SP")]
        uf: String,
        /// User-Agent com contato, exigido pela política do Nominatim
        #[arg(long, default_value = "cnpj-mapa/0.3 (contato: seu-email@exemplo.com)")]
        user_agent: String,
        /// Teto de endereços novos geocodificados nesta execução
        #[arg(long)]
        max_geocode: Option<u64>,
        /// Mantém no JSON as empresas sem coordenadas (marcadas)
        #[arg(long)]
        manter_sem_coordenadas: bool,
        /// Reconsulta endereços com falha lembrada no cache
        #[arg(long)]
        reprocessar_falhas: bool,
    },
    /// Exporta o cache de geocodificação como JSON de mapa
    GeocacheJson {
        /// CSV de cache de geocodificação
        #[arg(long, default_value = "geocache_enderecos.csv")]
        geocache: String,
        /// Caminho do JSON de saída
        #[arg(short, long, default_value = "geocache.json")]
        out_json: String,
        /// Meta opcional: cidade
        #[arg(long, default_value = "São Carlos")]
        cidade: String,
        /// Meta opcional: UF
        #[arg(long, default_value = "SP")]
        uf: String,
    },
    /// Sugere um chunksize a partir da RAM disponível e de uma amostra
    Chunks {
        /// Pasta com os arquivos ESTABELE para amostrar
        #[arg(short, long, default_value = "dados-publicos")]
        input_dir: String,
        /// Linhas amostradas do primeiro arquivo
        #[arg(long, default_value = "10000")]
        amostra: usize,
    },
}

/// Amostra o primeiro ESTABELE, mede bytes por linha e sugere um chunksize
/// que caiba na memória disponível.
fn diagnostico_chunks(input_dir: &str, amostra: usize) -> Result<()> {
    ui::print_header("📐 Sugestão de chunksize");
    let est_files = utils::get_files_by_pattern(input_dir, "*.ESTABELE*")?;
    let est_path = est_files.first().ok_or_else(|| {
        anyhow::anyhow!("Nenhum arquivo *.ESTABELE* encontrado em {}", input_dir)
    })?;
    ui::print_info(&format!("Amostrando {:?} ({} linha(s))", est_path, amostra));

    let bytes_por_linha = utils::estimate_bytes_per_row(est_path, amostra)?;
    let disponivel = utils::available_ram_bytes();
    let (chunksize, orcamento) = utils::suggest_chunksize(bytes_por_linha, disponivel);

    ui::print_statistics(&[
        ("Bytes por linha (estimado)", bytes_por_linha as u64),
        ("RAM disponível (MB)", disponivel / (1024 * 1024)),
        ("Orçamento por chunk (MB)", orcamento / (1024 * 1024)),
        ("Chunksize sugerido (linhas)", chunksize as u64),
    ]);
    ui::print_info(&format!("Use: --chunksize {}", chunksize));
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Inicializa o módulo de UI com as configurações globais
    ui::init(cli.quiet, cli.verbose);

    if let Err(err) = executar(cli).await {
        ui::print_error(&format!("{:#}", err));
        std::process::exit(1);
    }
}

async fn executar(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Filtrar {
            input_dir,
            cidade,
            uf,
            cnae,
            output,
            chunksize,
        } => {
            filtro::run(&filtro::FiltroConfig {
                input_dir,
                output,
                cidades: cidade,
                uf,
                cnaes: cnae,
                chunksize,
                auto_yes: cli.yes,
            })?;
        }
        Commands::FiltrarCnae {
            input,
            cnae,
            output,
            chunksize,
        } => {
            cnae::run(&cnae::CnaeConfig {
                input,
                output,
                cnaes: cnae,
                chunksize,
                auto_yes: cli.yes,
            })?;
        }
        Commands::Empresas {
            input,
            input_dir,
            output,
        } => {
            empresas::run(&empresas::EmpresasConfig {
                input,
                input_dir,
                output,
                auto_yes: cli.yes,
            })?;
        }
        Commands::Socios {
            input,
            input_dir,
            output,
            only,
            max_n,
            chunksize,
        } => {
            socios::run(&socios::SociosConfig {
                input,
                input_dir,
                output,
                only,
                max_n,
                chunksize,
                auto_yes: cli.yes,
            })?;
        }
        Commands::Mapa {
            base,
            enriquecida,
            geocache,
            out_json,
            log_falhas,
            debug_candidatos,
            cidade,
            uf,
            user_agent,
            max_geocode,
            manter_sem_coordenadas,
            reprocessar_falhas,
        } => {
            mapa::run(&mapa::MapaConfig {
                base,
                enriquecida,
                geocache,
                out_json,
                log_falhas,
                debug_candidatos,
                cidade,
                uf,
                user_agent,
                max_geocode,
                manter_sem_coordenadas,
                reprocessar_falhas,
                auto_yes: cli.yes,
            })
            .await?;
        }
        Commands::GeocacheJson {
            geocache,
            out_json,
            cidade,
            uf,
        } => {
            mapa::exportar_geocache(&mapa::GeocacheJsonConfig {
                geocache,
                out_json,
                cidade,
                uf,
                auto_yes: cli.yes,
            })?;
        }
        Commands::Chunks { input_dir, amostra } => {
            diagnostico_chunks(&input_dir, amostra)?;
        }
    }

    Ok(())
}
