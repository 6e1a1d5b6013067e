use anyhow::Result;
use std::collections::HashMap;
use std::path::Path;

use crate::models::{Empresa, Estabelecimento, Municipio, Socio};
use crate::ui;
use crate::utils;

pub const COLS_EMPRESA: usize = 7;
pub const COLS_SOCIO: usize = 11;

/// Conta as colunas da primeira linha legível. `None` para arquivo vazio.
pub fn detect_column_count(path: &Path) -> Result<Option<usize>> {
    let mut rdr = utils::latin1_csv_reader(path)?;
    for result in rdr.records() {
        if let Ok(record) = result {
            return Ok(Some(record.len()));
        }
    }
    Ok(None)
}

/// Os estabelecimentos circulam em dois layouts publicados: 30 colunas (sem
/// ddd_fax) e 31 (com ddd_fax inserido antes do fax). Qualquer outra contagem
/// é erro fatal com o arquivo nomeado.
pub fn detect_estabelecimento_layout(path: &Path) -> Result<Option<usize>> {
    match detect_column_count(path)? {
        None => Ok(None),
        Some(n @ (30 | 31)) => Ok(Some(n)),
        Some(n) => anyhow::bail!(
            "Layout ESTABELECIMENTOS inesperado em {:?}: {} colunas (esperado 30 ou 31)",
            path,
            n
        ),
    }
}

/// Decodificação posicional de uma linha de K*.ESTABELE*. Retorna `None`
/// quando a linha não tem a contagem de colunas do layout detectado.
pub fn decode_estabelecimento(record: &csv::StringRecord, layout: usize) -> Option<Estabelecimento> {
    if record.len() != layout {
        return None;
    }
    let cell = |i: usize| utils::clean_cell(record.get(i).unwrap_or(""));

    let (ddd_fax, fax, email, sit_esp, data_sit_esp) = if layout == 31 {
        (cell(26), cell(27), cell(28), cell(29), cell(30))
    } else {
        (String::new(), cell(26), cell(27), cell(28), cell(29))
    };

    Some(Estabelecimento {
        cnpj_basico: cell(0),
        cnpj_ordem: cell(1),
        cnpj_dv: cell(2),
        matriz_filial: cell(3),
        nome_fantasia: cell(4),
        situacao_cadastral: cell(5),
        data_situacao_cadastral: cell(6),
        motivo_situacao_cadastral: cell(7),
        nome_cidade_exterior: cell(8),
        pais: cell(9),
        data_inicio_atividades: cell(10),
        cnae_fiscal: cell(11),
        cnae_fiscal_secundaria: cell(12),
        tipo_logradouro: cell(13),
        logradouro: cell(14),
        numero: cell(15),
        complemento: cell(16),
        bairro: cell(17),
        cep: cell(18),
        uf: cell(19),
        codigo_municipio: cell(20),
        municipio: cell(21),
        ddd1: cell(22),
        telefone1: cell(23),
        ddd2: cell(24),
        telefone2: cell(25),
        ddd_fax,
        fax,
        correio_eletronico: email,
        situacao_especial: sit_esp,
        data_situacao_especial: data_sit_esp,
    })
}

pub fn decode_empresa(record: &csv::StringRecord) -> Option<Empresa> {
    if record.len() != COLS_EMPRESA {
        return None;
    }
    let cell = |i: usize| utils::clean_cell(record.get(i).unwrap_or(""));
    Some(Empresa {
        cnpj_basico: cell(0),
        razao_social: cell(1),
        natureza_juridica: cell(2),
        qualificacao_responsavel: cell(3),
        capital_social_str: cell(4),
        porte_empresa: cell(5),
        ente_federativo_responsavel: cell(6),
    })
}

pub fn decode_socio(record: &csv::StringRecord) -> Option<Socio> {
    if record.len() != COLS_SOCIO {
        return None;
    }
    let cell = |i: usize| utils::clean_cell(record.get(i).unwrap_or(""));
    Some(Socio {
        cnpj_basico: cell(0),
        identificador_de_socio: cell(1),
        nome_socio: cell(2),
        cnpj_cpf_socio: cell(3),
        qualificacao_socio: cell(4),
        data_entrada_sociedade: cell(5),
        pais: cell(6),
        representante_legal: cell(7),
        nome_representante: cell(8),
        qualificacao_representante_legal: cell(9),
        faixa_etaria: cell(10),
    })
}

/// Carrega *MUNICCSV*: 2 colunas (código;nome) ou 3 (código;nome;uf).
pub fn load_municipios(path: &Path) -> Result<Vec<Municipio>> {
    let primeiro = match detect_column_count(path)? {
        None => anyhow::bail!("Tabela de municípios vazia: {:?}", path),
        Some(n) if n < 2 => anyhow::bail!(
            "Layout de municípios inesperado em {:?}: {} coluna(s) (esperado 2 ou 3)",
            path,
            n
        ),
        Some(n) => n,
    };
    let tem_uf = primeiro >= 3;

    let mut municipios = Vec::new();
    let mut ignoradas = 0u64;
    let mut rdr = utils::latin1_csv_reader(path)?;
    for result in rdr.records() {
        let record = match result {
            Ok(r) => r,
            Err(_) => {
                ignoradas += 1;
                continue;
            }
        };
        if record.len() < 2 {
            ignoradas += 1;
            continue;
        }
        let uf = if tem_uf && record.len() >= 3 {
            let valor = utils::clean_cell(record.get(2).unwrap_or(""));
            (!valor.is_empty()).then_some(valor)
        } else {
            None
        };
        municipios.push(Municipio {
            codigo: utils::clean_cell(record.get(0).unwrap_or("")),
            nome: utils::clean_cell(record.get(1).unwrap_or("")),
            uf,
        });
    }

    if ignoradas > 0 {
        ui::print_verbose(&format!(
            "{} linha(s) malformada(s) ignorada(s) em {:?}",
            ignoradas, path
        ));
    }
    Ok(municipios)
}

fn chave_codigo(codigo: &str) -> String {
    let stripped = codigo.trim().trim_start_matches('0');
    if stripped.is_empty() {
        codigo.trim().to_string()
    } else {
        stripped.to_string()
    }
}

/// Carrega uma tabela código;descrição (QUALSCSV, PAISCSV, CNAECSV).
/// As chaves são normalizadas sem zeros à esquerda, já que os códigos
/// aparecem das duas formas nos arquivos grandes.
pub fn load_codigo_map(path: &Path) -> Result<HashMap<String, String>> {
    let mut mapa = HashMap::new();
    let mut rdr = utils::latin1_csv_reader(path)?;
    for result in rdr.records() {
        let record = match result {
            Ok(r) => r,
            Err(_) => continue,
        };
        if record.len() < 2 {
            continue;
        }
        let codigo = utils::clean_cell(record.get(0).unwrap_or(""));
        let descricao = utils::clean_cell(record.get(1).unwrap_or(""));
        if !codigo.is_empty() {
            mapa.insert(chave_codigo(&codigo), descricao);
        }
    }
    Ok(mapa)
}

pub fn decode_codigo<'a>(mapa: &'a HashMap<String, String>, codigo: &str) -> Option<&'a str> {
    mapa.get(&chave_codigo(codigo)).map(|s| s.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn grava_latin1(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut arquivo = tempfile::NamedTempFile::new().unwrap();
        arquivo.write_all(bytes).unwrap();
        arquivo.flush().unwrap();
        arquivo
    }

    fn linha_estabelecimento(n_cols: usize) -> Vec<String> {
        let mut campos = vec![String::new(); n_cols];
        campos[0] = "12345678".into();
        campos[1] = "0001".into();
        campos[2] = "90".into();
        campos[4] = "PADARIA DO ZE".into();
        campos[5] = "02".into();
        campos[13] = "RUA".into();
        campos[14] = "DAS FLORES".into();
        campos[19] = "SP".into();
        campos[20] = "6477".into();
        if n_cols == 31 {
            campos[26] = "16".into();
            campos[27] = "33719999".into();
            campos[28] = "ze@padaria.com".into();
        } else {
            campos[26] = "33719999".into();
            campos[27] = "ze@padaria.com".into();
        }
        campos
    }

    #[test]
    fn decodifica_layouts_30_e_31() {
        let r30 = csv::StringRecord::from(linha_estabelecimento(30));
        let est30 = decode_estabelecimento(&r30, 30).unwrap();
        assert_eq!(est30.cnpj_basico, "12345678");
        assert_eq!(est30.ddd_fax, "");
        assert_eq!(est30.fax, "33719999");
        assert_eq!(est30.correio_eletronico, "ze@padaria.com");

        let r31 = csv::StringRecord::from(linha_estabelecimento(31));
        let est31 = decode_estabelecimento(&r31, 31).unwrap();
        assert_eq!(est31.ddd_fax, "16");
        assert_eq!(est31.fax, "33719999");
        assert_eq!(est31.correio_eletronico, "ze@padaria.com");
    }

    #[test]
    fn linha_com_contagem_errada_vira_none() {
        let r = csv::StringRecord::from(vec!["a", "b", "c"]);
        assert!(decode_estabelecimento(&r, 30).is_none());
        assert!(decode_empresa(&r).is_none());
        assert!(decode_socio(&r).is_none());
    }

    #[test]
    fn celulas_passam_pela_limpeza() {
        let mut campos = linha_estabelecimento(30);
        campos[4] = "  PADARIA  ".into();
        campos[16] = "NA".into();
        let est = decode_estabelecimento(&csv::StringRecord::from(campos), 30).unwrap();
        assert_eq!(est.nome_fantasia, "PADARIA");
        assert_eq!(est.complemento, "");
    }

    #[test]
    fn detecta_layout_e_rejeita_contagem_estranha() {
        let ok = grava_latin1(&[b"a;".repeat(29), b"a\n".to_vec()].concat());
        assert_eq!(detect_estabelecimento_layout(ok.path()).unwrap(), Some(30));

        let vazio = grava_latin1(b"");
        assert_eq!(detect_estabelecimento_layout(vazio.path()).unwrap(), None);

        let errado = grava_latin1(b"a;b;c\n");
        let err = detect_estabelecimento_layout(errado.path()).unwrap_err();
        assert!(err.to_string().contains("3 colunas"));
    }

    #[test]
    fn municipios_latin1_com_e_sem_uf() {
        // "SÃO CARLOS" em latin1: 0xC3 no lugar do Ã
        let duas = grava_latin1(b"6477;S\xC3O CARLOS\n6213;IBAT\xC9\n");
        let lista = load_municipios(duas.path()).unwrap();
        assert_eq!(lista.len(), 2);
        assert_eq!(lista[0].nome, "SÃO CARLOS");
        assert_eq!(lista[1].nome, "IBATÉ");
        assert!(lista[0].uf.is_none());

        let tres = grava_latin1(b"6477;S\xC3O CARLOS;SP\n");
        let lista = load_municipios(tres.path()).unwrap();
        assert_eq!(lista[0].uf.as_deref(), Some("SP"));
    }

    #[test]
    fn mapa_de_codigos_tolera_zero_a_esquerda() {
        let arquivo = grava_latin1(b"05;Administrador\n49;S\xF3cio-Administrador\n");
        let mapa = load_codigo_map(arquivo.path()).unwrap();
        assert_eq!(decode_codigo(&mapa, "05"), Some("Administrador"));
        assert_eq!(decode_codigo(&mapa, "5"), Some("Administrador"));
        assert_eq!(decode_codigo(&mapa, "49"), Some("Sócio-Administrador"));
        assert_eq!(decode_codigo(&mapa, "99"), None);
    }
}
