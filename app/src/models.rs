use serde::{Deserialize, Serialize};

/// Situação cadastral do estabelecimento, decodificada do código numérico.
/// Os códigos aparecem com e sem zero à esquerda nos arquivos ("02" e "2").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SituacaoCadastral {
    Nula,
    Ativa,
    Suspensa,
    Inapta,
    Baixada,
    Desconhecida,
}

impl SituacaoCadastral {
    pub fn from_codigo(codigo: &str) -> Self {
        match codigo.trim() {
            "01" | "1" => SituacaoCadastral::Nula,
            "02" | "2" => SituacaoCadastral::Ativa,
            "03" | "3" => SituacaoCadastral::Suspensa,
            "04" | "4" => SituacaoCadastral::Inapta,
            "08" | "8" => SituacaoCadastral::Baixada,
            _ => SituacaoCadastral::Desconhecida,
        }
    }

    pub fn rotulo(&self) -> &'static str {
        match self {
            SituacaoCadastral::Nula => "Nula",
            SituacaoCadastral::Ativa => "Ativa",
            SituacaoCadastral::Suspensa => "Suspensa",
            SituacaoCadastral::Inapta => "Inapta",
            SituacaoCadastral::Baixada => "Baixada",
            SituacaoCadastral::Desconhecida => "Desconhecida",
        }
    }
}

pub fn porte_empresa_txt(codigo: &str) -> &'static str {
    match codigo.trim() {
        "00" | "0" => "Não informado",
        "01" | "1" => "Microempresa",
        "03" | "3" => "Empresa de Pequeno Porte",
        "05" | "5" => "Demais",
        _ => "Desconhecido",
    }
}

pub fn identificador_socio_txt(codigo: &str) -> &'static str {
    match codigo.trim() {
        "1" => "Pessoa Jurídica",
        "2" => "Pessoa Física",
        "3" => "Estrangeiro",
        _ => "Desconhecido",
    }
}

/// Registro lógico de K*.ESTABELE*, igual para os layouts de 30 e 31 colunas
/// (o de 30 não traz ddd_fax; fica vazio).
#[derive(Debug, Clone)]
pub struct Estabelecimento {
    pub cnpj_basico: String,
    pub cnpj_ordem: String,
    pub cnpj_dv: String,
    pub matriz_filial: String,
    pub nome_fantasia: String,
    pub situacao_cadastral: String,
    pub data_situacao_cadastral: String,
    pub motivo_situacao_cadastral: String,
    pub nome_cidade_exterior: String,
    pub pais: String,
    pub data_inicio_atividades: String,
    pub cnae_fiscal: String,
    pub cnae_fiscal_secundaria: String,
    pub tipo_logradouro: String,
    pub logradouro: String,
    pub numero: String,
    pub complemento: String,
    pub bairro: String,
    pub cep: String,
    pub uf: String,
    pub codigo_municipio: String,
    pub municipio: String,
    pub ddd1: String,
    pub telefone1: String,
    pub ddd2: String,
    pub telefone2: String,
    pub ddd_fax: String,
    pub fax: String,
    pub correio_eletronico: String,
    pub situacao_especial: String,
    pub data_situacao_especial: String,
}

/// Registro de K*.EMPRECSV* (7 colunas).
#[derive(Debug, Clone)]
pub struct Empresa {
    pub cnpj_basico: String,
    pub razao_social: String,
    pub natureza_juridica: String,
    pub qualificacao_responsavel: String,
    pub capital_social_str: String,
    pub porte_empresa: String,
    pub ente_federativo_responsavel: String,
}

/// Registro de K*.SOCIOCSV* (11 colunas).
#[derive(Debug, Clone)]
pub struct Socio {
    pub cnpj_basico: String,
    pub identificador_de_socio: String,
    pub nome_socio: String,
    pub cnpj_cpf_socio: String,
    pub qualificacao_socio: String,
    pub data_entrada_sociedade: String,
    pub pais: String,
    pub representante_legal: String,
    pub nome_representante: String,
    pub qualificacao_representante_legal: String,
    pub faixa_etaria: String,
}

/// Município da tabela *MUNICCSV* (2 ou 3 colunas; a UF é opcional).
#[derive(Debug, Clone)]
pub struct Municipio {
    pub codigo: String,
    pub nome: String,
    pub uf: Option<String>,
}

/// Entrada da lista agregada de sócios, serializada em JSON na célula
/// `socios` da saída do estágio de sócios e reaproveitada no JSON final.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SocioResumo {
    pub nome: String,
    pub identificador: String,
    pub qualificacao: String,
    pub pais: String,
    pub faixa_etaria: String,
    pub data_entrada: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn situacao_aceita_codigo_com_e_sem_zero() {
        assert_eq!(SituacaoCadastral::from_codigo("02"), SituacaoCadastral::Ativa);
        assert_eq!(SituacaoCadastral::from_codigo("2"), SituacaoCadastral::Ativa);
        assert_eq!(SituacaoCadastral::from_codigo(" 08 "), SituacaoCadastral::Baixada);
        assert_eq!(SituacaoCadastral::from_codigo("99"), SituacaoCadastral::Desconhecida);
        assert_eq!(SituacaoCadastral::from_codigo(""), SituacaoCadastral::Desconhecida);
        assert_eq!(SituacaoCadastral::from_codigo("04").rotulo(), "Inapta");
    }

    #[test]
    fn porte_decodifica_variantes() {
        assert_eq!(porte_empresa_txt("00"), "Não informado");
        assert_eq!(porte_empresa_txt("0"), "Não informado");
        assert_eq!(porte_empresa_txt("01"), "Microempresa");
        assert_eq!(porte_empresa_txt("3"), "Empresa de Pequeno Porte");
        assert_eq!(porte_empresa_txt("05"), "Demais");
        assert_eq!(porte_empresa_txt(""), "Desconhecido");
        assert_eq!(porte_empresa_txt("07"), "Desconhecido");
    }

    #[test]
    fn identificador_decodifica_tipos() {
        assert_eq!(identificador_socio_txt("1"), "Pessoa Jurídica");
        assert_eq!(identificador_socio_txt("2"), "Pessoa Física");
        assert_eq!(identificador_socio_txt("3"), "Estrangeiro");
        assert_eq!(identificador_socio_txt("9"), "Desconhecido");
    }
}
